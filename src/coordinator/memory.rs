//! In-memory coordinator.
//!
//! Holds sessions, named config sections and a task queue, and records every
//! task update and session write. A task stops being handed out once an
//! update with `done = 1` was reported for it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use crate::coordinator::traits::RecordClient;
use crate::coordinator::types::{JsonMap, Section, SectionName, SessionRecord, Task, TaskUpdate};
use crate::error::CoordinatorError;

#[derive(Default)]
struct Inner {
    tasks: Vec<Task>,
    sessions: HashMap<i64, SessionRecord>,
    configs: HashMap<String, JsonMap>,
    updates: Vec<(String, TaskUpdate)>,
    extra_writes: Vec<(i64, SectionName, Section)>,
    session_reads: usize,
}

#[derive(Clone, Default)]
pub struct MemoryRecordClient {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRecordClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_session(&self, session: SessionRecord) {
        self.inner().sessions.insert(session.id, session);
    }

    pub fn add_config(&self, name: impl Into<String>, values: JsonMap) {
        self.inner().configs.insert(name.into(), values);
    }

    pub fn push_task(&self, task: Task) {
        self.inner().tasks.push(task);
    }

    pub fn session(&self, id: i64) -> Option<SessionRecord> {
        self.inner().sessions.get(&id).cloned()
    }

    /// Updates reported for `task_id`, oldest first.
    pub fn updates_for(&self, task_id: &str) -> Vec<TaskUpdate> {
        self.inner()
            .updates
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, update)| update.clone())
            .collect()
    }

    pub fn is_done(&self, task_id: &str) -> bool {
        self.updates_for(task_id).iter().any(TaskUpdate::is_done)
    }

    pub fn extra_writes(&self) -> Vec<(i64, SectionName, Section)> {
        self.inner().extra_writes.clone()
    }

    pub fn session_reads(&self) -> usize {
        self.inner().session_reads
    }
}

#[async_trait]
impl RecordClient for MemoryRecordClient {
    async fn fetch_tasks(&self, _worker: &str) -> Result<Vec<Task>, CoordinatorError> {
        let inner = self.inner();
        Ok(inner
            .tasks
            .iter()
            .filter(|task| {
                !inner
                    .updates
                    .iter()
                    .any(|(id, update)| *id == task.id && update.is_done())
            })
            .cloned()
            .collect())
    }

    async fn update_task(
        &self,
        _worker: &str,
        task_id: &str,
        update: &TaskUpdate,
    ) -> Result<(), CoordinatorError> {
        self.inner()
            .updates
            .push((task_id.to_string(), update.clone()));
        Ok(())
    }

    async fn get_session(&self, id: i64) -> Result<SessionRecord, CoordinatorError> {
        let mut inner = self.inner();
        inner.session_reads += 1;
        inner
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound {
                entity: "session".to_string(),
                id: id.to_string(),
            })
    }

    async fn update_session_extra(
        &self,
        id: i64,
        name: SectionName,
        section: &Section,
    ) -> Result<(), CoordinatorError> {
        let mut inner = self.inner();
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or_else(|| CoordinatorError::NotFound {
                entity: "session".to_string(),
                id: id.to_string(),
            })?;
        *session.extra.section_mut(name) = section.clone();
        session.extra.other.insert(
            "updated".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        inner.extra_writes.push((id, name, section.clone()));
        Ok(())
    }

    async fn get_config(&self, section: &str) -> Result<JsonMap, CoordinatorError> {
        self.inner()
            .configs
            .get(section)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound {
                entity: "config".to_string(),
                id: section.to_string(),
            })
    }
}
