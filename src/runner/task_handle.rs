//! Handle binding a running job to its watchdog and execution task.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::runner::cancelable::Cancelable;

/// Cancellable handle to a submitted job. Cheap to clone.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    task_id: u64,
    job: Arc<dyn Cancelable>,
    cancelled: AtomicBool,
    interrupt: CancellationToken,
    watchdog: OnceLock<AbortHandle>,
    execution: OnceLock<AbortHandle>,
    started: Instant,
}

impl TaskHandle {
    pub(crate) fn new(task_id: u64, job: Arc<dyn Cancelable>, interrupt: CancellationToken) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                task_id,
                job,
                cancelled: AtomicBool::new(false),
                interrupt,
                watchdog: OnceLock::new(),
                execution: OnceLock::new(),
                started: Instant::now(),
            }),
        }
    }

    pub(crate) fn attach_watchdog(&self, watchdog: AbortHandle) {
        if self.inner.watchdog.set(watchdog).is_err() {
            tracing::warn!(task_id = self.inner.task_id, "Watchdog already attached");
        }
    }

    pub(crate) fn attach_execution(&self, execution: AbortHandle) {
        if self.inner.execution.set(execution).is_err() {
            tracing::warn!(task_id = self.inner.task_id, "Execution already attached");
        }
    }

    pub(crate) fn job(&self) -> &Arc<dyn Cancelable> {
        &self.inner.job
    }

    pub(crate) fn interrupt_token(&self) -> &CancellationToken {
        &self.inner.interrupt
    }

    /// Stop the watchdog without cancelling the job.
    pub(crate) fn cancel_watchdog(&self) {
        if let Some(watchdog) = self.inner.watchdog.get() {
            watchdog.abort();
        }
    }

    /// Stop the watchdog, ask the job to stop, and signal the execution
    /// task. The execution task then gives the job its cancel grace before
    /// dropping it.
    ///
    /// The job's own `cancel` runs on the first call only.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(task_id = self.inner.task_id, "Cancelling task");
        self.cancel_watchdog();
        self.inner.job.cancel();
        self.inner.interrupt.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// True once the execution task has finished, whether it completed,
    /// was interrupted, or panicked.
    pub fn is_done(&self) -> bool {
        self.inner
            .execution
            .get()
            .map(|execution| execution.is_finished())
            .unwrap_or(false)
    }

    pub fn task_id(&self) -> u64 {
        self.inner.task_id
    }

    pub fn started(&self) -> Instant {
        self.inner.started
    }

    /// Time since submission.
    pub fn age(&self) -> Duration {
        self.inner.started.elapsed()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.inner.task_id)
            .field("cancelled", &self.is_cancelled())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingJob {
        cancels: AtomicUsize,
    }

    #[async_trait]
    impl Cancelable for CountingJob {
        async fn run(&self) {}

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_cancel_invokes_job_once() {
        let job = Arc::new(CountingJob::default());
        let handle = TaskHandle::new(1, job.clone(), CancellationToken::new());

        handle.cancel();
        handle.cancel();
        handle.clone().cancel();

        assert!(handle.is_cancelled());
        assert_eq!(job.cancels.load(Ordering::SeqCst), 1);
        assert!(handle.interrupt_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_aborts_watchdog() {
        let handle = TaskHandle::new(1, Arc::new(CountingJob::default()), CancellationToken::new());
        let watchdog = tokio::spawn(tokio::time::sleep(Duration::from_secs(3600)));
        handle.attach_watchdog(watchdog.abort_handle());

        handle.cancel();

        let err = watchdog.await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_counts_from_creation() {
        let handle = TaskHandle::new(1, Arc::new(CountingJob::default()), CancellationToken::new());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(handle.age(), Duration::from_secs(3));
        assert!(handle.started() <= Instant::now());
    }

    #[tokio::test]
    async fn test_is_done_tracks_execution() {
        let handle = TaskHandle::new(1, Arc::new(CountingJob::default()), CancellationToken::new());
        assert!(!handle.is_done());

        let execution = tokio::spawn(async {});
        handle.attach_execution(execution.abort_handle());
        execution.await.unwrap();

        assert!(handle.is_done());
    }
}
