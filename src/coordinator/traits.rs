//! `RecordClient`: the worker's single view of the coordinator.
//!
//! Covers the task queue (pending tasks, progress updates) and the session
//! record API (fetch a session, push one `extra` sub-section, read named
//! configuration sections).

use async_trait::async_trait;

use crate::coordinator::types::{JsonMap, Section, SectionName, SessionRecord, Task, TaskUpdate};
use crate::error::CoordinatorError;

/// Backend-agnostic coordinator client.
///
/// Session updates are read-modify-write on one named sub-section; two writers
/// racing on the same sub-section are last-writer-wins.
#[async_trait]
pub trait RecordClient: Send + Sync {
    // ── Task queue ──────────────────────────────────────────────────

    /// Tasks currently assigned to `worker` and not yet done.
    async fn fetch_tasks(&self, worker: &str) -> Result<Vec<Task>, CoordinatorError>;

    /// Send a progress or completion event for a task.
    async fn update_task(
        &self,
        worker: &str,
        task_id: &str,
        update: &TaskUpdate,
    ) -> Result<(), CoordinatorError>;

    // ── Session records ─────────────────────────────────────────────

    /// Fetch the current state of a session.
    async fn get_session(&self, id: i64) -> Result<SessionRecord, CoordinatorError>;

    /// Replace one sub-section of the session's `extra`.
    async fn update_session_extra(
        &self,
        id: i64,
        name: SectionName,
        section: &Section,
    ) -> Result<(), CoordinatorError>;

    // ── Configuration ───────────────────────────────────────────────

    /// Fetch a named configuration section (e.g. `irods`, `scipion`).
    async fn get_config(&self, section: &str) -> Result<JsonMap, CoordinatorError>;
}
