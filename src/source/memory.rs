//! In-memory source registry.
//!
//! Implements every lookup collaborator at once, for hosts that keep their
//! sources in process and for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::domain::Schedule;
use crate::error::{Result, TraversalError};
use crate::source::{BatchJob, JobProvider, ScheduleStore, SourceEnumerator};

/// Sources keyed by id, each with a schedule and an optional job.
#[derive(Default)]
pub struct MemorySourceRegistry {
    schedules: Mutex<BTreeMap<String, Schedule>>,
    jobs: Mutex<HashMap<String, Arc<dyn BatchJob>>>,
    shutdowns: AtomicUsize,
}

impl MemorySourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, replacing any previous entry with the same id.
    pub fn add_source(&self, schedule: Schedule, job: Arc<dyn BatchJob>) {
        let id = schedule.source_id.clone();
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), job);
        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, schedule);
    }

    /// Drop a source. Returns whether it existed.
    pub fn remove_source(&self, source_id: &str) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id);
        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id)
            .is_some()
    }

    /// Detach the job while keeping the schedule, as during reconfiguration.
    pub fn detach_job(&self, source_id: &str) -> Option<Arc<dyn BatchJob>> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id)
    }

    pub fn schedule(&self, source_id: &str) -> Option<Schedule> {
        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_id)
            .cloned()
    }

    /// How many times `JobProvider::shutdown` has been called.
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl SourceEnumerator for MemorySourceRegistry {
    fn list_source_ids(&self) -> Vec<String> {
        self.schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl ScheduleStore for MemorySourceRegistry {
    fn get_schedule(&self, source_id: &str) -> Result<Schedule> {
        self.schedule(source_id)
            .ok_or_else(|| TraversalError::ScheduleNotFound(source_id.to_string()))
    }

    fn set_schedule(&self, schedule: &Schedule) -> Result<()> {
        let mut schedules = self.schedules.lock().unwrap_or_else(PoisonError::into_inner);
        match schedules.get_mut(&schedule.source_id) {
            Some(existing) => {
                *existing = schedule.clone();
                Ok(())
            }
            None => Err(TraversalError::SourceNotFound(schedule.source_id.clone())),
        }
    }
}

impl JobProvider for MemorySourceRegistry {
    fn get_job(&self, source_id: &str) -> Result<Arc<dyn BatchJob>> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_id)
            .cloned()
            .ok_or_else(|| TraversalError::SourceNotFound(source_id.to_string()))
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
