//! Collaborator interfaces consumed by the scheduler.
//!
//! The scheduler never fetches documents or persists configuration itself.
//! Hosts plug those concerns in through the traits below:
//! - **BatchJob**: one source's cancellable unit of work
//! - **JobProvider**: resolves a source id to its current job
//! - **SourceEnumerator**: lists source ids, re-queried every tick
//! - **ScheduleStore**: reads and writes per-source schedules
//! - **StatusSink**: fire-and-forget heartbeat publication

pub mod memory;
pub mod simulated;

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{BatchResult, Schedule};
use crate::error::Result;

pub use memory::MemorySourceRegistry;
pub use simulated::SimulatedJob;

/// A source's batch of work.
///
/// `run_batch` should process at most `batch_hint` items. `cancel` may be
/// called from any thread while `run_batch` is in progress and must make it
/// return promptly, reporting whatever it managed to process.
#[async_trait]
pub trait BatchJob: Send + Sync {
    async fn run_batch(&self, batch_hint: usize) -> Result<BatchResult>;

    fn cancel(&self);
}

/// Resolves source ids to jobs.
pub trait JobProvider: Send + Sync {
    /// Fails when the source is unknown or mid-reconfiguration.
    fn get_job(&self, source_id: &str) -> Result<Arc<dyn BatchJob>>;

    /// Release resources when the scheduler shuts down.
    fn shutdown(&self) {}
}

pub trait SourceEnumerator: Send + Sync {
    fn list_source_ids(&self) -> Vec<String>;
}

pub trait ScheduleStore: Send + Sync {
    fn get_schedule(&self, source_id: &str) -> Result<Schedule>;

    fn set_schedule(&self, schedule: &Schedule) -> Result<()>;
}

/// Observability sink. Implementations must not block or panic.
pub trait StatusSink: Send + Sync {
    fn publish(&self, key: &str, value: serde_json::Value);
}

/// Status sink that writes to the debug log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn publish(&self, key: &str, value: serde_json::Value) {
        tracing::debug!(key = key, value = %value, "Status");
    }
}
