//! Worker: polls for tasks and drives one handler run per task.
//!
//! - `state`: handler run phases and the cooperative stop flag
//! - `scheduler`: tracking of spawned runs and parked handlers
//! - `worker`: poll loop and the handler driver

pub mod scheduler;
pub mod state;
pub mod worker;

pub use scheduler::Scheduler;
pub use state::{HandlerPhase, HandlerState, ParkedHandler, PhaseTransition, RunOutcome, StopFlag};
pub use worker::{SHUTDOWN_GRACE, Worker, drive, resume};
