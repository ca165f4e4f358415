//! Error types for the traversal scheduler
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur while scheduling traversals
#[derive(Debug, Error)]
pub enum TraversalError {
    /// Source is not known to the collaborator that was asked
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// No schedule stored for the source
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(String),

    /// Schedule value could not be parsed or is out of range
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Schedule store read/write failure
    #[error("Store error: {0}")]
    Store(String),

    /// A batch job failed while running
    #[error("Batch failed: {0}")]
    Batch(String),

    /// Invalid lifecycle transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias for traversal scheduler operations
pub type Result<T> = std::result::Result<T, TraversalError>;
