//! Cancellable work units and batch result recording.
//!
//! The task runner only knows `Cancelable`. `CancelableBatch` adapts a
//! source's `BatchJob` to it and hands the outcome to a
//! `BatchResultRecorder`, so the runner never needs to know about sources.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::{BatchResult, TraversalDelayPolicy};
use crate::source::BatchJob;

/// Work the task runner can execute and cancel.
///
/// Both methods may be called from threads other than the submitter's.
/// `cancel` must make an in-progress `run` return promptly.
#[async_trait]
pub trait Cancelable: Send + Sync {
    async fn run(&self);

    fn cancel(&self);
}

/// Receives the outcome of a batch, exactly once.
pub trait BatchResultRecorder: Send {
    fn record_result(&self, result: BatchResult);
}

impl<F> BatchResultRecorder for F
where
    F: Fn(BatchResult) + Send,
{
    fn record_result(&self, result: BatchResult) {
        self(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Running,
    Finished,
}

#[derive(Debug)]
struct BatchState {
    phase: Phase,
    cancelled: bool,
}

/// A source's job bound to a batch hint and a result recorder.
///
/// A batch cancelled before it starts never calls the job; it records an
/// error result with nothing processed. Cancels reach the job only while
/// its `run_batch` is in progress.
pub struct CancelableBatch {
    source_id: String,
    job: Arc<dyn BatchJob>,
    batch_hint: usize,
    state: Mutex<BatchState>,
    recorder: Mutex<Option<Box<dyn BatchResultRecorder>>>,
}

impl CancelableBatch {
    pub fn new(
        source_id: impl Into<String>,
        job: Arc<dyn BatchJob>,
        batch_hint: usize,
        recorder: Box<dyn BatchResultRecorder>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            job,
            batch_hint,
            state: Mutex::new(BatchState {
                phase: Phase::Pending,
                cancelled: false,
            }),
            recorder: Mutex::new(Some(recorder)),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn batch_hint(&self) -> usize {
        self.batch_hint
    }

    /// Move to `Running` unless cancelled or already run. Returns whether
    /// the job should be called.
    fn begin(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.phase != Phase::Pending || state.cancelled {
            state.phase = Phase::Finished;
            return false;
        }
        state.phase = Phase::Running;
        true
    }

    fn finish(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).phase = Phase::Finished;
    }

    fn record(&self, result: BatchResult) {
        let recorder = self
            .recorder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(recorder) = recorder {
            recorder.record_result(result);
        }
    }
}

/// Records an error result if the batch future is dropped before the job
/// returns.
struct PendingRecord<'a> {
    batch: &'a CancelableBatch,
    start: Instant,
}

impl Drop for PendingRecord<'_> {
    fn drop(&mut self) {
        // No-op once the normal path has taken the recorder.
        self.batch
            .record(BatchResult::finished(TraversalDelayPolicy::Error, 0, self.start));
    }
}

#[async_trait]
impl Cancelable for CancelableBatch {
    async fn run(&self) {
        let start = Instant::now();
        let pending = PendingRecord { batch: self, start };

        if !self.begin() {
            tracing::info!(source_id = %self.source_id, "Batch cancelled before start");
            return;
        }

        let outcome = self.job.run_batch(self.batch_hint).await;
        self.finish();

        let result = match outcome {
            Ok(result) => {
                tracing::debug!(
                    source_id = %self.source_id,
                    count = result.count_processed(),
                    policy = ?result.delay_policy(),
                    rate = result.rate_per_second(),
                    "Batch finished"
                );
                result
            }
            Err(e) => {
                tracing::error!(source_id = %self.source_id, error = %e, "Batch failed");
                BatchResult::error(start)
            }
        };

        self.record(result);
        drop(pending);
    }

    fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let forward = !state.cancelled && state.phase == Phase::Running;
        state.cancelled = true;
        if forward {
            tracing::info!(source_id = %self.source_id, "Cancelling batch");
            self.job.cancel();
        } else {
            tracing::debug!(source_id = %self.source_id, phase = ?state.phase, "Cancel for batch not in progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TraversalError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    struct FixedJob {
        result: Option<BatchResult>,
        cancels: AtomicUsize,
    }

    #[async_trait]
    impl BatchJob for FixedJob {
        async fn run_batch(&self, _batch_hint: usize) -> Result<BatchResult> {
            self.result
                .ok_or_else(|| TraversalError::Batch("boom".to_string()))
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct HangingJob;

    #[async_trait]
    impl BatchJob for HangingJob {
        async fn run_batch(&self, _batch_hint: usize) -> Result<BatchResult> {
            std::future::pending().await
        }

        fn cancel(&self) {}
    }

    fn collecting_recorder() -> (Arc<Mutex<Vec<BatchResult>>>, Box<dyn BatchResultRecorder>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let recorder = move |result: BatchResult| sink.lock().unwrap().push(result);
        (seen, Box::new(recorder))
    }

    #[tokio::test]
    async fn test_records_job_result() {
        let outcome = BatchResult::finished(TraversalDelayPolicy::Poll, 12, Instant::now());
        let job = Arc::new(FixedJob {
            result: Some(outcome),
            cancels: AtomicUsize::new(0),
        });
        let (seen, recorder) = collecting_recorder();
        let batch = CancelableBatch::new("A", job, 50, recorder);

        batch.run().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], outcome);
    }

    #[tokio::test]
    async fn test_job_error_recorded_as_error_policy() {
        let job = Arc::new(FixedJob {
            result: None,
            cancels: AtomicUsize::new(0),
        });
        let (seen, recorder) = collecting_recorder();
        let batch = CancelableBatch::new("A", job, 50, recorder);

        batch.run().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].delay_policy(), TraversalDelayPolicy::Error);
        assert_eq!(seen[0].count_processed(), 0);
    }

    #[tokio::test]
    async fn test_records_at_most_once() {
        let outcome = BatchResult::finished(TraversalDelayPolicy::Immediate, 1, Instant::now());
        let job = Arc::new(FixedJob {
            result: Some(outcome),
            cancels: AtomicUsize::new(0),
        });
        let (seen, recorder) = collecting_recorder();
        let batch = CancelableBatch::new("A", job, 50, recorder);

        batch.run().await;
        batch.run().await;

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_run_still_records() {
        let (seen, recorder) = collecting_recorder();
        let batch = CancelableBatch::new("A", Arc::new(HangingJob), 50, recorder);

        let timed_out = tokio::time::timeout(Duration::from_millis(20), batch.run()).await;
        assert!(timed_out.is_err());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].delay_policy(), TraversalDelayPolicy::Error);
    }

    /// Signals once it has started, then waits for `cancel`.
    #[derive(Default)]
    struct WaitForCancelJob {
        started: Notify,
        calls: AtomicUsize,
        cancels: AtomicUsize,
        token: CancellationToken,
    }

    #[async_trait]
    impl BatchJob for WaitForCancelJob {
        async fn run_batch(&self, _batch_hint: usize) -> Result<BatchResult> {
            let start = Instant::now();
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.token.cancelled().await;
            Ok(BatchResult::finished(TraversalDelayPolicy::Error, 7, start))
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.token.cancel();
        }
    }

    #[tokio::test]
    async fn test_cancel_forwards_to_running_job() {
        let job = Arc::new(WaitForCancelJob::default());
        let (seen, recorder) = collecting_recorder();
        let batch = Arc::new(CancelableBatch::new("A", job.clone(), 50, recorder));

        let running = {
            let batch = batch.clone();
            tokio::spawn(async move { batch.run().await })
        };
        job.started.notified().await;
        batch.cancel();
        batch.cancel();
        running.await.unwrap();

        assert_eq!(job.cancels.load(Ordering::SeqCst), 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].count_processed(), 7);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_job() {
        let job = Arc::new(WaitForCancelJob::default());
        let (seen, recorder) = collecting_recorder();
        let batch = CancelableBatch::new("A", job.clone(), 50, recorder);

        batch.cancel();
        batch.run().await;

        assert_eq!(job.calls.load(Ordering::SeqCst), 0);
        assert_eq!(job.cancels.load(Ordering::SeqCst), 0);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].delay_policy(), TraversalDelayPolicy::Error);
        assert_eq!(seen[0].count_processed(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_finish_is_not_forwarded() {
        let outcome = BatchResult::finished(TraversalDelayPolicy::Immediate, 1, Instant::now());
        let job = Arc::new(FixedJob {
            result: Some(outcome),
            cancels: AtomicUsize::new(0),
        });
        let (_seen, recorder) = collecting_recorder();
        let batch = CancelableBatch::new("A", job.clone(), 50, recorder);

        batch.run().await;
        batch.cancel();

        assert_eq!(job.cancels.load(Ordering::SeqCst), 0);
    }
}
