//! Traversal scheduler - the top-level control loop.
//!
//! Once per tick, for every known source, the scheduler decides whether to
//! start a batch: the source must be enabled, idle, inside one of its
//! schedule intervals, out of cooldown, and have load left in the current
//! period. Batches go to the `TaskRunner`; when one finishes, its recorder
//! feeds the result back into the `HostLoadManager` and, for a drained
//! source whose schedule says so, disables the schedule.
//!
//! The live-task table and the removed-this-tick set share one mutex, so the
//! check that a source is idle and the insertion of its new handle happen
//! atomically with respect to `remove_connector`. A cancelled batch stays in
//! the table until its execution finishes, so a source relisted after removal
//! never has two batches in flight.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Timelike;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SchedulerConfig};
use crate::domain::{BatchResult, Schedule, TraversalDelayPolicy};
use crate::error::{Result, TraversalError};
use crate::runner::{BatchResultRecorder, CancelableBatch, TaskHandle, TaskRunner};
use crate::scheduler::host_load::HostLoadManager;
use crate::source::{JobProvider, LogStatusSink, MemorySourceRegistry, ScheduleStore, SourceEnumerator, StatusSink};

/// Status key for the per-tick heartbeat.
pub const HEARTBEAT_KEY: &str = "traversal.scheduler.heartbeat";

/// Lifecycle of the scheduler. `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Uninitialized,
    Running,
    Shutdown,
}

/// The collaborators a scheduler works against.
#[derive(Clone)]
pub struct SourceContext {
    pub sources: Arc<dyn SourceEnumerator>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub jobs: Arc<dyn JobProvider>,
    pub status: Arc<dyn StatusSink>,
}

impl SourceContext {
    pub fn new(
        sources: Arc<dyn SourceEnumerator>,
        schedules: Arc<dyn ScheduleStore>,
        jobs: Arc<dyn JobProvider>,
    ) -> Self {
        Self {
            sources,
            schedules,
            jobs,
            status: Arc::new(LogStatusSink),
        }
    }

    /// Use one in-memory registry for every lookup.
    pub fn from_registry(registry: Arc<MemorySourceRegistry>) -> Self {
        Self::new(registry.clone(), registry.clone(), registry)
    }

    pub fn with_status_sink(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    pub fn with_schedule_store(mut self, schedules: Arc<dyn ScheduleStore>) -> Self {
        self.schedules = schedules;
        self
    }
}

#[derive(Default)]
struct LiveTasks {
    running: HashMap<String, TaskHandle>,
    removed: HashSet<String>,
}

impl LiveTasks {
    fn is_busy(&self, source_id: &str) -> bool {
        self.running
            .get(source_id)
            .map(|handle| !handle.is_done())
            .unwrap_or(false)
    }
}

/// Auto-disabled sources, keyed by id, holding the schedule as it was
/// before the disable. Covers the window where the store write failed.
type AutoDisabled = Arc<Mutex<HashMap<String, Schedule>>>;

struct SchedulerInner {
    config: SchedulerConfig,
    context: SourceContext,
    runtime: Handle,
    runner: TaskRunner,
    load_manager: Arc<HostLoadManager>,
    live: Mutex<LiveTasks>,
    auto_disabled: AutoDisabled,
    state: Mutex<SchedulerState>,
    stop: CancellationToken,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    ticks: AtomicU64,
}

/// Runs batches for many sources, one at a time per source.
#[derive(Clone)]
pub struct TraversalScheduler {
    inner: Arc<SchedulerInner>,
}

impl TraversalScheduler {
    /// Create a scheduler from the full configuration. Must be called from
    /// within a Tokio runtime.
    pub fn new(config: &Config, context: SourceContext) -> Result<Self> {
        let load_manager = Arc::new(HostLoadManager::new(config.load.host_load_config()));
        Self::with_load_manager(config.scheduler.clone(), load_manager, context)
    }

    pub fn with_load_manager(
        config: SchedulerConfig,
        load_manager: Arc<HostLoadManager>,
        context: SourceContext,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| TraversalError::InvalidState(format!("scheduler needs a Tokio runtime: {}", e)))?;
        let runner = TaskRunner::new(config.task_runner_config())?;

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                config,
                context,
                runtime,
                runner,
                load_manager,
                live: Mutex::new(LiveTasks::default()),
                auto_disabled: Arc::new(Mutex::new(HashMap::new())),
                state: Mutex::new(SchedulerState::Uninitialized),
                stop: CancellationToken::new(),
                loop_task: Mutex::new(None),
                ticks: AtomicU64::new(0),
            }),
        })
    }

    /// Start the loop. A no-op while already running.
    pub fn init(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            SchedulerState::Running => return Ok(()),
            SchedulerState::Shutdown => {
                return Err(TraversalError::InvalidState("scheduler has been shut down".to_string()));
            }
            SchedulerState::Uninitialized => {}
        }
        *state = SchedulerState::Running;

        let loop_task = self.inner.runtime.spawn(run_loop(self.inner.clone()));
        *self.inner.loop_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(loop_task);

        tracing::info!(
            tick_interval_ms = self.inner.config.tick_interval_ms,
            "Traversal scheduler started"
        );
        Ok(())
    }

    /// Stop the loop, drain the task runner, and release the job provider.
    ///
    /// A no-op once shut down. Returns whether all batches finished within
    /// the configured shutdown wait.
    pub async fn shutdown(&self) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == SchedulerState::Shutdown {
                return self.inner.runner.in_flight() == 0;
            }
            *state = SchedulerState::Shutdown;
        }
        tracing::info!("Traversal scheduler shutting down");

        self.inner.stop.cancel();
        let loop_task = self
            .inner
            .loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(loop_task) = loop_task {
            if let Err(e) = loop_task.await {
                tracing::error!(error = %e, "Scheduler loop ended abnormally");
            }
        }

        let drained = self
            .inner
            .runner
            .shutdown(self.inner.config.interrupt_on_shutdown, self.inner.config.shutdown_wait())
            .await;
        self.inner.context.jobs.shutdown();

        tracing::info!(drained = drained, "Traversal scheduler stopped");
        drained
    }

    /// Run one scheduling pass at the current local hour.
    pub fn tick(&self) -> usize {
        self.inner.tick()
    }

    /// Run one scheduling pass as if the local hour were `hour`.
    pub fn tick_at(&self, hour: u32) -> usize {
        self.inner.tick_at(hour)
    }

    /// Cancel any batch in flight for the source and forget its load state.
    pub fn remove_connector(&self, source_id: &str) {
        self.inner.remove_connector(source_id)
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while a batch for the source is in flight.
    pub fn is_running(&self, source_id: &str) -> bool {
        self.inner
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_busy(source_id)
    }

    /// Sources with a batch in flight, sorted.
    pub fn running_sources(&self) -> Vec<String> {
        let live = self.inner.live.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = live
            .running
            .iter()
            .filter(|(_, handle)| !handle.is_done())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn tick_count(&self) -> u64 {
        self.inner.ticks.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.runner.in_flight()
    }

    pub fn load_manager(&self) -> &Arc<HostLoadManager> {
        &self.inner.load_manager
    }
}

async fn run_loop(inner: Arc<SchedulerInner>) {
    let tick_interval = inner.config.tick_interval();

    while !inner.stop.is_cancelled() {
        inner.tick();

        tokio::select! {
            _ = inner.stop.cancelled() => break,
            _ = tokio::time::sleep(tick_interval) => {}
        }
    }

    tracing::debug!("Scheduler loop exited");
}

impl SchedulerInner {
    fn tick(&self) -> usize {
        self.tick_at(chrono::Local::now().hour())
    }

    fn tick_at(&self, hour: u32) -> usize {
        {
            let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            live.removed.clear();
            live.running.retain(|_, handle| !handle.is_done());
        }

        let source_ids = self.context.sources.list_source_ids();
        let submitted = source_ids
            .iter()
            .filter(|source_id| self.try_start_batch(source_id, hour))
            .count();

        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let running = self.live.lock().unwrap_or_else(PoisonError::into_inner).running.len();
        self.context.status.publish(
            HEARTBEAT_KEY,
            json!({
                "tick": tick,
                "sources": source_ids.len(),
                "submitted": submitted,
                "running": running,
            }),
        );

        if submitted > 0 {
            tracing::debug!(tick = tick, submitted = submitted, "Batches submitted");
        }
        submitted
    }

    fn try_start_batch(&self, source_id: &str, hour: u32) -> bool {
        if self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .removed
            .contains(source_id)
        {
            return false;
        }

        let schedule = match self.context.schedules.get_schedule(source_id) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::warn!(source_id = %source_id, error = %e, "Schedule unavailable, skipping");
                return false;
            }
        };
        if self.is_auto_disabled(source_id, &schedule) || schedule.disabled {
            return false;
        }
        if self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_busy(source_id)
        {
            return false;
        }
        if !schedule.in_interval(hour) {
            tracing::trace!(source_id = %source_id, hour = hour, "Outside schedule intervals");
            return false;
        }
        if self.load_manager.should_delay(source_id) {
            return false;
        }

        let job = match self.context.jobs.get_job(source_id) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(source_id = %source_id, error = %e, "Job unavailable, skipping");
                return false;
            }
        };

        let mut batch_hint = self.load_manager.determine_batch_hint(source_id);
        if schedule.load > 0 {
            batch_hint = batch_hint.min(schedule.load);
        }
        if batch_hint == 0 {
            return false;
        }
        let Some(generation) = self.load_manager.generation(source_id) else {
            return false;
        };

        let recorder = SourceResultRecorder {
            source_id: source_id.to_string(),
            generation,
            schedule,
            load_manager: self.load_manager.clone(),
            schedules: self.context.schedules.clone(),
            auto_disabled: self.auto_disabled.clone(),
            error_delay: self.config.error_delay(),
        };
        let batch = Arc::new(CancelableBatch::new(source_id, job, batch_hint, Box::new(recorder)));

        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if live.removed.contains(source_id) {
            // Removed while we were deciding; drop state the hint recreated.
            self.load_manager.remove_connector(source_id);
            return false;
        }
        if live.is_busy(source_id) {
            return false;
        }
        match self.runner.submit(batch) {
            Some(handle) => {
                tracing::debug!(
                    source_id = %source_id,
                    task_id = handle.task_id(),
                    batch_hint = batch_hint,
                    "Batch started"
                );
                live.running.insert(source_id.to_string(), handle);
                true
            }
            None => false,
        }
    }

    /// Keep skipping an auto-disabled source until the store returns
    /// something other than the schedule we disabled.
    fn is_auto_disabled(&self, source_id: &str, loaded: &Schedule) -> bool {
        let mut auto_disabled = self.auto_disabled.lock().unwrap_or_else(PoisonError::into_inner);
        match auto_disabled.get(source_id) {
            Some(snapshot) if snapshot == loaded => true,
            Some(_) => {
                auto_disabled.remove(source_id);
                false
            }
            None => false,
        }
    }

    fn remove_connector(&self, source_id: &str) {
        {
            let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            // Left in the table until done; the next tick reaps it.
            if let Some(handle) = live.running.get(source_id).filter(|handle| !handle.is_done()) {
                tracing::info!(
                    source_id = %source_id,
                    task_id = handle.task_id(),
                    age_ms = handle.age().as_millis() as u64,
                    "Cancelling batch for removed source"
                );
                handle.cancel();
            }
            live.removed.insert(source_id.to_string());
        }
        self.load_manager.remove_connector(source_id);
        self.auto_disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id);
    }
}

/// Feeds one batch's result back into throttling and the schedule.
struct SourceResultRecorder {
    source_id: String,
    /// Load-state generation the batch was started under.
    generation: u64,
    schedule: Schedule,
    load_manager: Arc<HostLoadManager>,
    schedules: Arc<dyn ScheduleStore>,
    auto_disabled: AutoDisabled,
    error_delay: Duration,
}

impl SourceResultRecorder {
    fn disable_polling(&self) {
        let mut disabled = self.schedule.clone();
        disabled.disabled = true;
        tracing::info!(source_id = %self.source_id, "Traversal complete, disabling schedule");

        self.auto_disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.source_id.clone(), self.schedule.clone());
        if let Err(e) = self.schedules.set_schedule(&disabled) {
            tracing::error!(
                source_id = %self.source_id,
                error = %e,
                "Failed to persist disabled schedule; source stays disabled in memory"
            );
        }
    }
}

impl BatchResultRecorder for SourceResultRecorder {
    fn record_result(&self, result: BatchResult) {
        if self.load_manager.generation(&self.source_id) != Some(self.generation) {
            tracing::debug!(source_id = %self.source_id, "Result for removed source ignored");
            return;
        }

        self.load_manager
            .update_num_docs_traversed(&self.source_id, result.count_processed());

        let wait = match result.delay_policy() {
            TraversalDelayPolicy::Immediate => Duration::ZERO,
            TraversalDelayPolicy::Poll => match self.schedule.retry_delay() {
                Some(delay) => delay,
                None => {
                    self.disable_polling();
                    Duration::ZERO
                }
            },
            TraversalDelayPolicy::Error => self.error_delay,
        };
        self.load_manager.connector_finished_traversal(&self.source_id, wait);
    }
}
