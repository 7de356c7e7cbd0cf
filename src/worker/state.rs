//! Handler run state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::handlers::{HandlerKind, TaskHandler};

/// Phase of one handler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerPhase {
    /// Built, not yet invoked.
    Pending,
    /// Being invoked repeatedly.
    Running,
    /// The handler returned `Stop`.
    Completed,
    /// The handler failed; the task was reported as errored and done.
    Failed,
    /// Cancelled or out of iterations; the task is left open.
    Stopped,
}

impl HandlerPhase {
    pub fn can_transition_to(&self, target: HandlerPhase) -> bool {
        use HandlerPhase::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Failed) | (Pending, Stopped) |
            (Running, Completed) | (Running, Failed) | (Running, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for HandlerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// A phase change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: HandlerPhase,
    pub to: HandlerPhase,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Bookkeeping for one handler run.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerState {
    pub task_id: String,
    pub kind: HandlerKind,
    /// Invocation counter handed to `process()`, starting at 1.
    pub count: u32,
    pub phase: HandlerPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<PhaseTransition>,
    pub last_error: Option<String>,
}

impl HandlerState {
    pub fn new(task_id: impl Into<String>, kind: HandlerKind) -> Self {
        Self {
            task_id: task_id.into(),
            kind,
            count: 1,
            phase: HandlerPhase::Pending,
            started_at: None,
            finished_at: None,
            transitions: Vec::new(),
            last_error: None,
        }
    }

    pub fn transition_to(
        &mut self,
        phase: HandlerPhase,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.phase.can_transition_to(phase) {
            return Err(format!("Cannot transition from {} to {}", self.phase, phase));
        }

        self.transitions.push(PhaseTransition {
            from: self.phase,
            to: phase,
            timestamp: Utc::now(),
            reason,
        });
        self.phase = phase;

        match phase {
            HandlerPhase::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            p if p.is_terminal() => {
                self.finished_at = Some(Utc::now());
            }
            _ => {}
        }

        Ok(())
    }

    /// Move to `Failed`, keeping the error text.
    pub fn fail(&mut self, error: impl Into<String>) {
        let error = error.into();
        let _ = self.transition_to(HandlerPhase::Failed, Some(error.clone()));
        self.last_error = Some(error);
    }
}

/// A handler left open by its iteration budget, resumed when the task is
/// fetched again.
pub struct ParkedHandler {
    pub handler: Box<dyn TaskHandler>,
    /// Count for the next invocation.
    pub next_count: u32,
}

impl ParkedHandler {
    /// A fresh handler, first invoked with count 1.
    pub fn new(handler: Box<dyn TaskHandler>) -> Self {
        Self {
            handler,
            next_count: 1,
        }
    }
}

impl std::fmt::Debug for ParkedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkedHandler")
            .field("task_id", &self.handler.task().id)
            .field("kind", &self.handler.kind())
            .field("next_count", &self.next_count)
            .finish()
    }
}

/// What a driver hands back when it ends.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: HandlerState,
    /// Set when the run stopped on its iteration budget.
    pub parked: Option<ParkedHandler>,
}

impl RunOutcome {
    pub fn finished(state: HandlerState) -> Self {
        Self {
            state,
            parked: None,
        }
    }
}

/// Cooperative cancellation shared between the worker and one driver.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless stopped first. Returns `false` when stopped.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // register before checking the flag so a concurrent stop() is not missed
        notified.as_mut().enable();
        if self.is_stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_stopped(),
            _ = notified => false,
        }
    }

    /// Resolve once `stop()` has been called.
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}
