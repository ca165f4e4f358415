//! Scheduling for source traversals.
//!
//! This module provides:
//! - **HostLoadManager**: per-source load caps over a period, plus cooldowns
//! - **TraversalScheduler**: the tick loop that decides which sources start
//!   a batch and feeds batch results back into load accounting
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use traversal_scheduler::config::Config;
//! use traversal_scheduler::scheduler::{SourceContext, TraversalScheduler};
//! use traversal_scheduler::source::MemorySourceRegistry;
//!
//! let registry = Arc::new(MemorySourceRegistry::new());
//! let scheduler = TraversalScheduler::new(&Config::default(), SourceContext::from_registry(registry))?;
//! scheduler.init()?;
//! // ...
//! scheduler.shutdown().await;
//! ```

mod host_load;
mod traversal;

pub use host_load::{HostLoadConfig, HostLoadManager};
pub use traversal::{HEARTBEAT_KEY, SchedulerState, SourceContext, TraversalScheduler};
