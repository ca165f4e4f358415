//! Task runner with per-job watchdogs and a single completion consumer.
//!
//! Every submitted job runs as its own Tokio task. Alongside it a watchdog
//! task sleeps for the maximum job lifetime and then cancels the job. One
//! consumer task drains finished jobs in completion order, logging panics and
//! interruptions so a failing job can never take the consumer down.
//!
//! Cancellation is cooperative first: the job's `cancel` is invoked and the
//! job gets `cancel_grace` to return from `run`. After that its future is
//! dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TraversalError};
use crate::runner::cancelable::Cancelable;
use crate::runner::task_handle::TaskHandle;

/// Default maximum job lifetime (30 minutes).
pub const DEFAULT_MAXIMUM_TASK_LIFE: Duration = Duration::from_secs(30 * 60);

/// Default time a cancelled job gets to return on its own.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the TaskRunner.
#[derive(Debug, Clone)]
pub struct TaskRunnerConfig {
    /// Jobs running longer than this are cancelled by their watchdog.
    pub maximum_task_life: Duration,
    /// How long a cancelled job may keep running before it is dropped.
    pub cancel_grace: Duration,
}

impl Default for TaskRunnerConfig {
    fn default() -> Self {
        Self {
            maximum_task_life: DEFAULT_MAXIMUM_TASK_LIFE,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

impl TaskRunnerConfig {
    pub fn with_maximum_task_life(mut self, maximum_task_life: Duration) -> Self {
        self.maximum_task_life = maximum_task_life;
        self
    }

    pub fn with_cancel_grace(mut self, cancel_grace: Duration) -> Self {
        self.cancel_grace = cancel_grace;
        self
    }
}

/// How a job's execution task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecOutcome {
    /// `run` returned without being cancelled
    Completed,
    /// `run` returned within the grace period after cancellation
    Interrupted,
    /// `run` ignored cancellation and was dropped
    Abandoned,
}

struct Completion {
    task_id: u64,
    join: JoinHandle<ExecOutcome>,
}

/// Runs cancellable jobs with a hard wall-clock lifetime each.
pub struct TaskRunner {
    config: TaskRunnerConfig,
    runtime: Handle,
    accepting: AtomicBool,
    next_task_id: AtomicU64,
    shutdown_token: CancellationToken,
    completion_tx: Mutex<Option<mpsc::UnboundedSender<Completion>>>,
    in_flight: Arc<watch::Sender<usize>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    /// Create a runner on the current Tokio runtime and start its
    /// completion consumer.
    pub fn new(config: TaskRunnerConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| TraversalError::InvalidState(format!("task runner needs a Tokio runtime: {}", e)))?;
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let consumer = runtime.spawn(drain_completions(completion_rx));
        let (in_flight, _) = watch::channel(0usize);

        Ok(Self {
            config,
            runtime,
            accepting: AtomicBool::new(true),
            next_task_id: AtomicU64::new(1),
            shutdown_token: CancellationToken::new(),
            completion_tx: Mutex::new(Some(completion_tx)),
            in_flight: Arc::new(in_flight),
            consumer: Mutex::new(Some(consumer)),
        })
    }

    pub fn config(&self) -> &TaskRunnerConfig {
        &self.config
    }

    /// Submit a job. Returns `None` when the runner is shutting down.
    pub fn submit(&self, job: Arc<dyn Cancelable>) -> Option<TaskHandle> {
        let completion_tx = {
            let guard = self.completion_tx.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(tx) if self.accepting.load(Ordering::SeqCst) => {
                    // Counted under the lock so shutdown cannot miss this job.
                    self.in_flight.send_modify(|n| *n += 1);
                    tx.clone()
                }
                _ => {
                    tracing::error!("Task rejected: runner is shutting down");
                    return None;
                }
            }
        };

        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let handle = TaskHandle::new(task_id, job, self.shutdown_token.child_token());

        let watchdog = {
            let handle = handle.clone();
            let lifetime = self.config.maximum_task_life;
            self.runtime.spawn(async move {
                tokio::time::sleep(lifetime).await;
                tracing::warn!(
                    task_id = handle.task_id(),
                    lifetime_ms = lifetime.as_millis() as u64,
                    "Task exceeded maximum lifetime, cancelling"
                );
                handle.cancel();
            })
        };
        handle.attach_watchdog(watchdog.abort_handle());

        let guard = ExecutionGuard {
            handle: handle.clone(),
            in_flight: self.in_flight.clone(),
        };
        let join = self
            .runtime
            .spawn(execute(handle.clone(), self.config.cancel_grace, guard));
        handle.attach_execution(join.abort_handle());

        if completion_tx.send(Completion { task_id, join }).is_err() {
            // Consumer already stopped; the job still runs but nobody logs it.
            tracing::warn!(task_id = task_id, "Completion consumer gone");
        }

        tracing::debug!(task_id = task_id, "Task submitted");
        Some(handle)
    }

    /// Number of jobs whose execution has not yet finished.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub fn is_shutdown(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs and wait up to `wait` for in-flight jobs to drain.
    ///
    /// With `interrupt_running`, every in-flight job is cancelled first.
    /// The completion consumer is always stopped. Returns whether all jobs
    /// finished within `wait`.
    pub async fn shutdown(&self, interrupt_running: bool, wait: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        let completion_tx = self
            .completion_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if interrupt_running {
            tracing::info!("Interrupting running tasks");
            self.shutdown_token.cancel();
        }

        let mut in_flight = self.in_flight.subscribe();
        let drained = tokio::time::timeout(wait, in_flight.wait_for(|n| *n == 0))
            .await
            .map(|waited| waited.is_ok())
            .unwrap_or(false);
        if !drained {
            tracing::warn!(in_flight = self.in_flight(), "Tasks still running after shutdown wait");
        }

        drop(completion_tx);
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.await {
                tracing::error!(error = %e, "Completion consumer failed");
            }
        }

        drained
    }
}

/// Decrements the in-flight count and stops the watchdog however the
/// execution task ends, including panics and aborts.
struct ExecutionGuard {
    handle: TaskHandle,
    in_flight: Arc<watch::Sender<usize>>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.handle.cancel_watchdog();
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

async fn execute(handle: TaskHandle, cancel_grace: Duration, guard: ExecutionGuard) -> ExecOutcome {
    let _guard = guard;
    let interrupt = handle.interrupt_token().clone();
    let mut run = handle.job().run();

    // Interrupt first, so a job cancelled before its first poll is told
    // before it starts.
    tokio::select! {
        biased;
        _ = interrupt.cancelled() => {
            // Reached via the runner's shutdown token as well as cancel().
            handle.cancel();
            match tokio::time::timeout(cancel_grace, &mut run).await {
                Ok(()) => ExecOutcome::Interrupted,
                Err(_) => ExecOutcome::Abandoned,
            }
        }
        _ = &mut run => ExecOutcome::Completed,
    }
}

async fn drain_completions(mut completion_rx: mpsc::UnboundedReceiver<Completion>) {
    let mut pending: FuturesUnordered<BoxFuture<'static, JoinedTask>> = FuturesUnordered::new();

    loop {
        tokio::select! {
            received = completion_rx.recv() => match received {
                Some(Completion { task_id, join }) => {
                    pending.push(Box::pin(async move { (task_id, join.await) }));
                }
                None => break,
            },
            Some((task_id, joined)) = pending.next(), if !pending.is_empty() => {
                log_completion(task_id, joined);
            }
        }
    }

    if !pending.is_empty() {
        tracing::debug!(pending = pending.len(), "Completion consumer stopping with tasks outstanding");
    }
}

type JoinedTask = (u64, std::result::Result<ExecOutcome, JoinError>);

fn log_completion(task_id: u64, joined: std::result::Result<ExecOutcome, JoinError>) {
    match joined {
        Ok(ExecOutcome::Completed) => tracing::debug!(task_id = task_id, "Task completed"),
        Ok(ExecOutcome::Interrupted) => tracing::info!(task_id = task_id, "Task interrupted"),
        Ok(ExecOutcome::Abandoned) => {
            tracing::warn!(task_id = task_id, "Task ignored cancellation and was dropped")
        }
        Err(e) if e.is_cancelled() => tracing::info!(task_id = task_id, "Task aborted"),
        Err(e) => tracing::error!(task_id = task_id, error = %e, "Task panicked"),
    }
}
