//! Domain types for the traversal scheduler
//!
//! - Schedule: when a source may run and how it backs off after draining
//! - BatchResult / TraversalDelayPolicy: outcome of one batch

pub mod batch_result;
pub mod schedule;

pub use batch_result::{BatchResult, TraversalDelayPolicy};
pub use schedule::{DEFAULT_RETRY_DELAY_MILLIS, POLLING_DISABLED, Schedule, ScheduleTimeInterval};
