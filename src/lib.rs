//! Traversal scheduler - paces batch traversals of many document sources.
//!
//! Each source has a schedule (hours it may run, preferred batch size,
//! delay between polls) and a job that processes one batch at a time. The
//! scheduler runs at most one batch per source, caps each source's load per
//! period, and cancels batches that outlive their maximum lifetime.

pub mod config;
pub mod domain;
pub mod error;
pub mod runner;
pub mod scheduler;
pub mod source;

pub use error::{Result, TraversalError};
