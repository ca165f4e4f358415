//! Batch outcome types.
//!
//! A `BatchResult` records what one traversal batch did and which
//! `TraversalDelayPolicy` applies before its source runs again.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// How long to wait before the source's next batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalDelayPolicy {
    /// Stopped early with work left; run again on the next tick
    Immediate,
    /// Drained all available work; wait the schedule's retry delay
    Poll,
    /// Failed; wait the error cooldown
    Error,
}

/// Immutable outcome of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    delay_policy: TraversalDelayPolicy,
    count_processed: usize,
    start_time: Instant,
    end_time: Instant,
}

impl BatchResult {
    /// Create a result. `end_time` is pushed to at least one millisecond past
    /// `start_time` so rates are always defined.
    pub fn new(
        delay_policy: TraversalDelayPolicy,
        count_processed: usize,
        start_time: Instant,
        end_time: Instant,
    ) -> Self {
        let min_end = start_time + Duration::from_millis(1);
        Self {
            delay_policy,
            count_processed,
            start_time,
            end_time: end_time.max(min_end),
        }
    }

    /// A result that ends now.
    pub fn finished(delay_policy: TraversalDelayPolicy, count_processed: usize, start_time: Instant) -> Self {
        Self::new(delay_policy, count_processed, start_time, Instant::now())
    }

    /// A failed batch that processed nothing.
    pub fn error(start_time: Instant) -> Self {
        Self::finished(TraversalDelayPolicy::Error, 0, start_time)
    }

    pub fn delay_policy(&self) -> TraversalDelayPolicy {
        self.delay_policy
    }

    pub fn count_processed(&self) -> usize {
        self.count_processed
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn end_time(&self) -> Instant {
        self.end_time
    }

    pub fn elapsed(&self) -> Duration {
        self.end_time - self.start_time
    }

    /// Items per second over the batch.
    pub fn rate_per_second(&self) -> f64 {
        self.count_processed as f64 / self.elapsed().as_secs_f64()
    }
}
