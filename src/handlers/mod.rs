//! Task handlers and the dispatch table that selects them.
//!
//! A handler is bound to one task. The worker's driver calls `process()`
//! repeatedly with an increasing invocation count until the handler returns
//! `Flow::Stop`, fails, or runs out of its iteration budget.

pub mod command;
pub mod fallback;
pub mod pipeline;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::config::WorkerConfig;
use crate::coordinator::{RecordClient, Task, TaskUpdate};
use crate::error::TaskError;
use crate::transfer::ConnectorFactory;

pub use command::CommandHandler;
pub use fallback::FallbackHandler;
pub use pipeline::{PipelineConfig, PipelineLaunch};
pub use session::{SessionAction, SessionHandler};

/// Handler family, selected by the task's `name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Command,
    Session,
    Fallback,
}

impl HandlerKind {
    pub fn for_task(name: &str) -> Self {
        match name {
            "command" => Self::Command,
            "session" => Self::Session,
            _ => Self::Fallback,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Session => "session",
            Self::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the driver should do after one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Invoke again after the handler interval.
    Continue,
    /// The handler is finished.
    Stop,
}

/// A unit of work bound to one task.
#[async_trait]
pub trait TaskHandler: Send {
    fn kind(&self) -> HandlerKind;

    fn task(&self) -> &Task;

    /// Run one invocation. `count` starts at 1.
    ///
    /// An `Err` is reported on the task as `error` plus `done` by the driver.
    async fn process(&mut self, count: u32) -> Result<Flow, TaskError>;
}

/// Shared dependencies handed to every handler.
#[derive(Clone)]
pub struct HandlerDeps {
    pub records: Arc<dyn RecordClient>,
    pub connectors: Arc<dyn ConnectorFactory>,
    pub config: WorkerConfig,
}

impl HandlerDeps {
    pub fn new(
        records: Arc<dyn RecordClient>,
        connectors: Arc<dyn ConnectorFactory>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            records,
            connectors,
            config,
        }
    }

    pub fn reporter(&self, task_id: &str) -> TaskReporter {
        TaskReporter {
            records: Arc::clone(&self.records),
            worker: self.config.worker_name.clone(),
            task_id: task_id.to_string(),
        }
    }
}

/// Sends task updates on behalf of one task.
#[derive(Clone)]
pub struct TaskReporter {
    records: Arc<dyn RecordClient>,
    worker: String,
    task_id: String,
}

impl TaskReporter {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn report(&self, update: TaskUpdate) -> Result<(), TaskError> {
        debug!(task_id = %self.task_id, done = update.is_done(), "Task update");
        self.records
            .update_task(&self.worker, &self.task_id, &update)
            .await?;
        Ok(())
    }

    /// Record `error` on the task and mark it done.
    pub async fn fail(&self, error: &TaskError) -> Result<(), TaskError> {
        self.report(TaskUpdate::new().error(error.to_string()).done())
            .await
    }
}

/// Build the handler for `task`.
///
/// Session handlers fetch their session here; failures surface as task errors.
pub async fn build_handler(
    task: Task,
    deps: &HandlerDeps,
) -> Result<Box<dyn TaskHandler>, TaskError> {
    let reporter = deps.reporter(&task.id);
    let handler: Box<dyn TaskHandler> = match HandlerKind::for_task(&task.name) {
        HandlerKind::Command => Box::new(CommandHandler::new(task, reporter)),
        HandlerKind::Session => Box::new(SessionHandler::new(task, deps.clone(), reporter).await?),
        HandlerKind::Fallback => Box::new(FallbackHandler::new(task, reporter)),
    };
    Ok(handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{JsonMap, MemoryRecordClient};
    use crate::transfer::MemoryStore;

    #[test]
    fn kind_for_task_name() {
        assert_eq!(HandlerKind::for_task("command"), HandlerKind::Command);
        assert_eq!(HandlerKind::for_task("session"), HandlerKind::Session);
        assert_eq!(HandlerKind::for_task("draw"), HandlerKind::Fallback);
        assert_eq!(HandlerKind::Session.to_string(), "session");
    }

    #[tokio::test]
    async fn session_handler_needs_existing_session() {
        let records = Arc::new(MemoryRecordClient::new());
        let deps = HandlerDeps::new(
            records,
            Arc::new(MemoryStore::new("h")),
            WorkerConfig::default(),
        );
        let mut args = JsonMap::new();
        args.insert("session_id".into(), 404.into());
        args.insert("action".into(), "monitor".into());

        let err = build_handler(Task::new("1", "session", args), &deps)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TaskError::Coordinator(_)));
    }

    #[tokio::test]
    async fn unknown_kinds_get_fallback() {
        let deps = HandlerDeps::new(
            Arc::new(MemoryRecordClient::new()),
            Arc::new(MemoryStore::new("h")),
            WorkerConfig::default(),
        );
        let handler = build_handler(Task::new("1", "draw", JsonMap::new()), &deps)
            .await
            .unwrap();
        assert_eq!(handler.kind(), HandlerKind::Fallback);
        assert_eq!(handler.task().id, "1");
    }
}
