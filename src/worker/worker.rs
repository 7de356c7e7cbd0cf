//! Poll loop and handler driver.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error::TaskError;
use crate::handlers::{Flow, HandlerDeps, HandlerKind, TaskHandler, TaskReporter, build_handler};
use crate::worker::scheduler::Scheduler;
use crate::worker::state::{HandlerPhase, HandlerState, ParkedHandler, RunOutcome, StopFlag};

/// How long shutdown waits for running handlers before aborting them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Polls the coordinator and runs one driver per assigned task.
pub struct Worker {
    deps: HandlerDeps,
    scheduler: Scheduler,
    shutdown: StopFlag,
}

impl Worker {
    pub fn new(deps: HandlerDeps) -> Self {
        Self {
            deps,
            scheduler: Scheduler::new(),
            shutdown: StopFlag::new(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Flag that ends `run()` when stopped.
    pub fn shutdown_handle(&self) -> StopFlag {
        self.shutdown.clone()
    }

    /// Poll until shutdown, then stop every handler run.
    pub async fn run(&self) -> Vec<HandlerState> {
        let config = &self.deps.config;
        info!(
            worker = %config.worker_name,
            coordinator = %config.coordinator_url,
            "Worker started, polling every {}s",
            config.poll_interval.as_secs()
        );

        let mut tick = tokio::time::interval(config.poll_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.shutdown.stopped() => break,
            }
            self.poll_once().await;
        }

        let running = self.scheduler.running_count().await;
        info!(running, "Worker shutting down");
        self.scheduler.stop_all().await;
        self.scheduler.wait_all(SHUTDOWN_GRACE).await
    }

    /// One poll cycle: reap, fetch, start or resume. Returns the number of
    /// runs started.
    pub async fn poll_once(&self) -> usize {
        for state in self.scheduler.reap_finished().await {
            info!(
                task_id = %state.task_id,
                kind = %state.kind,
                phase = %state.phase,
                count = state.count,
                "Handler run finished"
            );
        }

        let tasks = match self.deps.records.fetch_tasks(&self.deps.config.worker_name).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Failed to fetch pending tasks");
                return 0;
            }
        };

        let pending: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        self.scheduler.retain_parked(&pending).await;

        let mut started = 0;
        for task in tasks {
            if self.scheduler.is_tracked(&task.id).await {
                debug!(task_id = %task.id, "Task already running");
                continue;
            }

            let task_id = task.id.clone();
            let kind = HandlerKind::for_task(&task.name);
            let reporter = self.deps.reporter(&task_id);

            let parked = match self.scheduler.take_parked(&task_id).await {
                Some(parked) => {
                    debug!(task_id = %task_id, count = parked.next_count, "Resuming parked handler");
                    parked
                }
                None => match build_handler(task, &self.deps).await {
                    Ok(handler) => ParkedHandler::new(handler),
                    Err(e) => {
                        error!(task_id = %task_id, kind = %kind, error = %e, "Failed to build handler");
                        if let Err(report_err) = reporter.fail(&e).await {
                            warn!(task_id = %task_id, error = %report_err, "Failed to report task error");
                        }
                        continue;
                    }
                },
            };

            let stop = StopFlag::new();
            let span = info_span!("task", task_id = %task_id, kind = %kind);
            let handle = tokio::spawn(
                resume(
                    parked,
                    reporter,
                    stop.clone(),
                    self.deps.config.handler_interval,
                    self.deps.config.max_iterations,
                )
                .instrument(span),
            );
            self.scheduler.insert(task_id, kind, handle, stop).await;
            started += 1;
        }
        started
    }
}

/// Invoke a fresh `handler` until it stops, fails, is cancelled or runs out
/// of iterations (`max_iterations` 0 = unlimited).
pub async fn drive(
    handler: Box<dyn TaskHandler>,
    reporter: TaskReporter,
    stop: StopFlag,
    interval: Duration,
    max_iterations: u32,
) -> RunOutcome {
    resume(ParkedHandler::new(handler), reporter, stop, interval, max_iterations).await
}

/// Like `drive`, continuing from the parked handler's count. The iteration
/// budget applies to this run only; when it runs out the handler is handed
/// back for the next poll.
pub async fn resume(
    parked: ParkedHandler,
    reporter: TaskReporter,
    stop: StopFlag,
    interval: Duration,
    max_iterations: u32,
) -> RunOutcome {
    let ParkedHandler {
        mut handler,
        next_count,
    } = parked;
    let mut state = HandlerState::new(handler.task().id.clone(), handler.kind());
    state.count = next_count;
    let _ = state.transition_to(HandlerPhase::Running, None);

    let mut iterations = 0;
    loop {
        let count = state.count;
        iterations += 1;
        let result = match AssertUnwindSafe(handler.process(count)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
        };

        match result {
            Ok(Flow::Stop) => {
                debug!(count, "Handler finished");
                let _ = state.transition_to(HandlerPhase::Completed, None);
                break;
            }
            Ok(Flow::Continue) => {}
            Err(e) => {
                error!(count, error = %e, "Handler failed");
                if let Err(report_err) = reporter.fail(&e).await {
                    warn!(error = %report_err, "Failed to report task error");
                }
                state.fail(e.to_string());
                break;
            }
        }

        if max_iterations > 0 && iterations >= max_iterations {
            info!(count, "Iteration budget exhausted; leaving task open");
            let _ = state.transition_to(
                HandlerPhase::Stopped,
                Some("iteration budget exhausted".to_string()),
            );
            return RunOutcome {
                state,
                parked: Some(ParkedHandler {
                    handler,
                    next_count: count + 1,
                }),
            };
        }

        state.count += 1;
        if !stop.sleep(interval).await {
            info!(count, "Handler cancelled");
            let _ = state.transition_to(HandlerPhase::Stopped, Some("cancelled".to_string()));
            break;
        }
    }

    RunOutcome::finished(state)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
