//! Bounded task runner.
//!
//! This module provides:
//! - **Cancelable**: the unit of work the runner executes
//! - **CancelableBatch**: a source's batch job bound to a hint and a recorder
//! - **TaskHandle**: cancels a running job together with its watchdog
//! - **TaskRunner**: runs jobs, enforces their maximum lifetime, and drains
//!   completions on a single consumer task

mod cancelable;
mod pool;
mod task_handle;

pub use cancelable::{BatchResultRecorder, Cancelable, CancelableBatch};
pub use pool::{DEFAULT_CANCEL_GRACE, DEFAULT_MAXIMUM_TASK_LIFE, TaskRunner, TaskRunnerConfig};
pub use task_handle::TaskHandle;
