//! Tracks spawned handler runs by task id.
//!
//! The worker consults the scheduler before building a handler so a task the
//! coordinator hands out again while it is still running is not started twice.
//! Runs that end on their iteration budget leave their handler parked here
//! until the task comes back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::handlers::HandlerKind;
use crate::worker::state::{HandlerPhase, HandlerState, ParkedHandler, RunOutcome, StopFlag};

/// A spawned driver and the flag that stops it.
#[derive(Debug)]
struct TrackedRun {
    kind: HandlerKind,
    handle: JoinHandle<RunOutcome>,
    stop: StopFlag,
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    runs: Arc<RwLock<HashMap<String, TrackedRun>>>,
    // Mutex: handlers are Send, not Sync
    parked: Arc<Mutex<HashMap<String, ParkedHandler>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_tracked(&self, task_id: &str) -> bool {
        self.runs.read().await.contains_key(task_id)
    }

    /// Track a driver. A previous run for the same id is aborted.
    pub async fn insert(
        &self,
        task_id: String,
        kind: HandlerKind,
        handle: JoinHandle<RunOutcome>,
        stop: StopFlag,
    ) {
        let previous = self
            .runs
            .write()
            .await
            .insert(task_id.clone(), TrackedRun { kind, handle, stop });
        if let Some(previous) = previous {
            warn!(task_id = %task_id, "Replacing a tracked handler run");
            previous.stop.stop();
            previous.handle.abort();
        }
    }

    /// Drop finished runs and return their final state. Handlers that ran out
    /// of iterations are parked.
    pub async fn reap_finished(&self) -> Vec<HandlerState> {
        let finished: Vec<(String, TrackedRun)> = {
            let mut runs = self.runs.write().await;
            let ids: Vec<String> = runs
                .iter()
                .filter(|(_, run)| run.handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| runs.remove(&id).map(|run| (id, run)))
                .collect()
        };

        let mut states = Vec::with_capacity(finished.len());
        for (task_id, run) in finished {
            match run.handle.await {
                Ok(RunOutcome { state, parked }) => {
                    debug!(task_id = %task_id, phase = %state.phase, count = state.count, "Handler run reaped");
                    if let Some(parked) = parked {
                        self.parked.lock().await.insert(task_id, parked);
                    }
                    states.push(state);
                }
                Err(e) => warn!(task_id = %task_id, error = %e, "Handler run ended abnormally"),
            }
        }
        states
    }

    /// Take the parked handler for `task_id`, if any.
    pub async fn take_parked(&self, task_id: &str) -> Option<ParkedHandler> {
        self.parked.lock().await.remove(task_id)
    }

    pub async fn parked_count(&self) -> usize {
        self.parked.lock().await.len()
    }

    /// Forget parked handlers whose task the coordinator no longer hands out.
    pub async fn retain_parked(&self, pending: &[&str]) {
        self.parked.lock().await.retain(|task_id, _| {
            let keep = pending.contains(&task_id.as_str());
            if !keep {
                debug!(task_id = %task_id, "Dropping parked handler");
            }
            keep
        });
    }

    pub async fn running_count(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn running_ids(&self) -> Vec<String> {
        self.runs.read().await.keys().cloned().collect()
    }

    /// Ask every run to stop at its next checkpoint.
    pub async fn stop_all(&self) {
        for (task_id, run) in self.runs.read().await.iter() {
            debug!(task_id = %task_id, "Stopping handler run");
            run.stop.stop();
        }
    }

    /// Wait for every tracked run, aborting those still busy after `grace`.
    pub async fn wait_all(&self, grace: Duration) -> Vec<HandlerState> {
        let runs: Vec<(String, TrackedRun)> = self.runs.write().await.drain().collect();
        let deadline = tokio::time::Instant::now() + grace;

        let mut states = Vec::with_capacity(runs.len());
        for (task_id, mut run) in runs {
            match tokio::time::timeout_at(deadline, &mut run.handle).await {
                Ok(Ok(outcome)) => states.push(outcome.state),
                Ok(Err(e)) => warn!(task_id = %task_id, error = %e, "Handler run ended abnormally"),
                Err(_) => {
                    warn!(task_id = %task_id, "Handler run did not stop in time; aborting");
                    run.handle.abort();
                    let mut state = HandlerState::new(task_id, run.kind);
                    let _ = state.transition_to(HandlerPhase::Stopped, Some("aborted".to_string()));
                    states.push(state);
                }
            }
        }
        self.parked.lock().await.clear();
        info!(stopped = states.len(), "All handler runs finished");
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::coordinator::{JsonMap, MemoryRecordClient, Task};
    use crate::handlers::{FallbackHandler, HandlerDeps, TaskHandler};
    use crate::transfer::MemoryStore;

    fn finished(task_id: &str) -> JoinHandle<RunOutcome> {
        let mut state = HandlerState::new(task_id, HandlerKind::Command);
        state.transition_to(HandlerPhase::Running, None).unwrap();
        state.transition_to(HandlerPhase::Completed, None).unwrap();
        tokio::spawn(async move { RunOutcome::finished(state) })
    }

    fn until_stopped(task_id: &str, stop: StopFlag) -> JoinHandle<RunOutcome> {
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let mut state = HandlerState::new(task_id, HandlerKind::Session);
            state.transition_to(HandlerPhase::Running, None).unwrap();
            while stop.sleep(Duration::from_secs(60)).await {}
            state.transition_to(HandlerPhase::Stopped, None).unwrap();
            RunOutcome::finished(state)
        })
    }

    fn out_of_iterations(task_id: &str) -> JoinHandle<RunOutcome> {
        let task = Task::new(task_id, "other", JsonMap::new());
        let reporter = deps().reporter(task_id);
        let handler: Box<dyn TaskHandler> = Box::new(FallbackHandler::new(task, reporter));
        let mut state = HandlerState::new(task_id, HandlerKind::Fallback);
        state.transition_to(HandlerPhase::Running, None).unwrap();
        state.transition_to(HandlerPhase::Stopped, None).unwrap();
        tokio::spawn(async move {
            RunOutcome {
                state,
                parked: Some(ParkedHandler {
                    handler,
                    next_count: 4,
                }),
            }
        })
    }

    fn deps() -> HandlerDeps {
        HandlerDeps::new(
            Arc::new(MemoryRecordClient::new()),
            Arc::new(MemoryStore::new("h")),
            WorkerConfig::default(),
        )
    }

    #[tokio::test]
    async fn budget_stopped_runs_are_parked() {
        let scheduler = Scheduler::new();
        scheduler.insert("p".into(), HandlerKind::Fallback, out_of_iterations("p"), StopFlag::new()).await;
        scheduler.insert("q".into(), HandlerKind::Fallback, out_of_iterations("q"), StopFlag::new()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(scheduler.reap_finished().await.len(), 2);
        assert!(!scheduler.is_tracked("p").await);
        assert_eq!(scheduler.parked_count().await, 2);

        scheduler.retain_parked(&["p"]).await;
        assert_eq!(scheduler.parked_count().await, 1);
        let parked = scheduler.take_parked("p").await.unwrap();
        assert_eq!(parked.next_count, 4);
        assert_eq!(parked.handler.task().id, "p");
        assert!(scheduler.take_parked("p").await.is_none());
    }

    #[tokio::test]
    async fn finished_runs_are_reaped() {
        let scheduler = Scheduler::new();
        scheduler.insert("a".into(), HandlerKind::Command, finished("a"), StopFlag::new()).await;
        let stop = StopFlag::new();
        scheduler.insert("b".into(), HandlerKind::Session, until_stopped("b", stop.clone()), stop).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reaped = scheduler.reap_finished().await;
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].task_id, "a");
        assert!(!scheduler.is_tracked("a").await);
        assert!(scheduler.is_tracked("b").await);
        assert_eq!(scheduler.running_ids().await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn stop_all_then_wait() {
        let scheduler = Scheduler::new();
        for id in ["x", "y"] {
            let stop = StopFlag::new();
            scheduler.insert(id.into(), HandlerKind::Session, until_stopped(id, stop.clone()), stop).await;
        }
        assert_eq!(scheduler.running_count().await, 2);

        scheduler.stop_all().await;
        let states = scheduler.wait_all(Duration::from_secs(5)).await;

        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.phase == HandlerPhase::Stopped));
        assert_eq!(scheduler.running_count().await, 0);
    }

    #[tokio::test]
    async fn wait_all_aborts_stragglers() {
        let scheduler = Scheduler::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            RunOutcome::finished(HandlerState::new("slow", HandlerKind::Command))
        });
        scheduler.insert("slow".into(), HandlerKind::Command, handle, StopFlag::new()).await;

        let states = scheduler.wait_all(Duration::from_millis(20)).await;
        assert_eq!(states[0].task_id, "slow");
        assert_eq!(states[0].phase, HandlerPhase::Stopped);
    }
}
