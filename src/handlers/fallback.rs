//! Handler for task kinds this worker does not know.

use async_trait::async_trait;
use tracing::warn;

use crate::coordinator::{Task, TaskUpdate};
use crate::error::TaskError;
use crate::handlers::{Flow, HandlerKind, TaskHandler, TaskReporter};

pub struct FallbackHandler {
    task: Task,
    reporter: TaskReporter,
}

impl FallbackHandler {
    pub fn new(task: Task, reporter: TaskReporter) -> Self {
        Self { task, reporter }
    }
}

#[async_trait]
impl TaskHandler for FallbackHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Fallback
    }

    fn task(&self) -> &Task {
        &self.task
    }

    async fn process(&mut self, _count: u32) -> Result<Flow, TaskError> {
        warn!(task_id = %self.task.id, kind = %self.task.name, "No handler for task kind");
        self.reporter
            .report(
                TaskUpdate::new()
                    .error(format!("no handler for task kind '{}'", self.task.name))
                    .done(),
            )
            .await?;
        Ok(Flow::Stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::coordinator::{JsonMap, MemoryRecordClient};
    use crate::handlers::HandlerDeps;
    use crate::transfer::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn reports_error_and_done() {
        let records = Arc::new(MemoryRecordClient::new());
        let deps = HandlerDeps::new(
            records.clone(),
            Arc::new(MemoryStore::new("h")),
            WorkerConfig::default(),
        );
        let mut handler =
            FallbackHandler::new(Task::new("7", "draw", JsonMap::new()), deps.reporter("7"));

        assert_eq!(handler.process(1).await.unwrap(), Flow::Stop);

        let updates = records.updates_for("7");
        assert_eq!(updates.len(), 1);
        assert!(updates[0].is_done());
        assert_eq!(
            updates[0].error_message(),
            Some("no handler for task kind 'draw'")
        );
    }
}
