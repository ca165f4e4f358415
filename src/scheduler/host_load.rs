//! Per-source load throttling.
//!
//! Each source may process up to its maximum load per accounting period.
//! The period is a fixed window that restarts once it has fully elapsed.
//! After every batch the source also gets a cooldown, set from the batch's
//! delay policy by the caller.
//!
//! The hint is advisory: jobs are trusted to process at most what they are
//! given.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Configuration for the HostLoadManager.
#[derive(Debug, Clone)]
pub struct HostLoadConfig {
    /// Items per period for sources without an explicit maximum.
    pub default_max_load: usize,
    /// Length of the accounting window.
    pub period: Duration,
    /// Upper bound on any single hint.
    pub batch_size: usize,
}

impl Default for HostLoadConfig {
    fn default() -> Self {
        Self {
            default_max_load: 1000,
            period: Duration::from_secs(60),
            batch_size: 500,
        }
    }
}

#[derive(Debug)]
struct LoadState {
    generation: u64,
    max_load: Option<usize>,
    docs_in_period: usize,
    period_start: Instant,
    retry_after: Option<Instant>,
    last_hint: Option<usize>,
}

impl LoadState {
    fn new(generation: u64, now: Instant) -> Self {
        Self {
            generation,
            max_load: None,
            docs_in_period: 0,
            period_start: now,
            retry_after: None,
            last_hint: None,
        }
    }

    fn roll_period(&mut self, now: Instant, period: Duration) {
        if now.duration_since(self.period_start) >= period {
            self.docs_in_period = 0;
            self.period_start = now;
        }
    }
}

/// Tracks per-source throughput and cooldowns.
///
/// Safe to call from the scheduler loop and from batch completions at once.
#[derive(Debug)]
pub struct HostLoadManager {
    config: HostLoadConfig,
    states: Mutex<HashMap<String, LoadState>>,
    next_generation: AtomicU64,
}

impl HostLoadManager {
    pub fn new(config: HostLoadConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn fresh_state(&self, now: Instant) -> LoadState {
        LoadState::new(self.next_generation.fetch_add(1, Ordering::SeqCst), now)
    }

    pub fn config(&self) -> &HostLoadConfig {
        &self.config
    }

    /// Override the per-period maximum for one source.
    pub fn set_max_load(&self, source_id: &str, max_load: usize) {
        let now = Instant::now();
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .entry(source_id.to_string())
            .or_insert_with(|| self.fresh_state(now))
            .max_load = Some(max_load);
    }

    /// True while the source's post-batch cooldown is running.
    pub fn should_delay(&self, source_id: &str) -> bool {
        let now = Instant::now();
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .get(source_id)
            .and_then(|state| state.retry_after)
            .map(|retry_after| now < retry_after)
            .unwrap_or(false)
    }

    /// Items the source may process in its next batch; 0 means skip.
    ///
    /// Within one period the hint never grows as consumption grows, and the
    /// hints never add up past the source's maximum load.
    pub fn determine_batch_hint(&self, source_id: &str) -> usize {
        let now = Instant::now();
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .entry(source_id.to_string())
            .or_insert_with(|| self.fresh_state(now));
        state.roll_period(now, self.config.period);

        let max_load = state.max_load.unwrap_or(self.config.default_max_load);
        let remaining = max_load.saturating_sub(state.docs_in_period);
        let hint = remaining.min(self.config.batch_size);
        state.last_hint = Some(hint);

        if hint == 0 {
            tracing::debug!(source_id = %source_id, max_load = max_load, "Load exhausted for period");
        }
        hint
    }

    /// Count items a finished batch processed. No-op for unknown sources.
    pub fn update_num_docs_traversed(&self, source_id: &str, count: usize) {
        if count == 0 {
            return;
        }
        let now = Instant::now();
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = states.get_mut(source_id) {
            state.roll_period(now, self.config.period);
            state.docs_in_period = state.docs_in_period.saturating_add(count);
        }
    }

    /// Start the source's cooldown. No-op for unknown sources.
    pub fn connector_finished_traversal(&self, source_id: &str, wait: Duration) {
        let now = Instant::now();
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = states.get_mut(source_id) {
            state.retry_after = if wait.is_zero() { None } else { Some(now + wait) };
        }
    }

    /// Forget everything about the source.
    pub fn remove_connector(&self, source_id: &str) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_id);
    }

    pub fn docs_in_period(&self, source_id: &str) -> Option<usize> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_id)
            .map(|state| state.docs_in_period)
    }

    /// Identifies one lifetime of the source's state. Changes when the
    /// source is removed and its state created again.
    pub fn generation(&self, source_id: &str) -> Option<u64> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_id)
            .map(|state| state.generation)
    }

    pub fn last_hint(&self, source_id: &str) -> Option<usize> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_id)
            .and_then(|state| state.last_hint)
    }

    /// Time left on the source's cooldown, if any.
    pub fn remaining_delay(&self, source_id: &str) -> Option<Duration> {
        let now = Instant::now();
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_id)
            .and_then(|state| state.retry_after)
            .filter(|retry_after| now < *retry_after)
            .map(|retry_after| retry_after - now)
    }
}

impl Default for HostLoadManager {
    fn default() -> Self {
        Self::new(HostLoadConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_load: usize, batch_size: usize) -> HostLoadManager {
        HostLoadManager::new(HostLoadConfig {
            default_max_load: max_load,
            period: Duration::from_secs(60),
            batch_size,
        })
    }

    #[test]
    fn test_first_hint_is_bounded_by_batch_size() {
        let m = manager(1000, 200);
        assert_eq!(m.determine_batch_hint("A"), 200);
        assert_eq!(m.last_hint("A"), Some(200));
    }

    #[test]
    fn test_first_hint_is_bounded_by_max_load() {
        let m = manager(100, 500);
        assert_eq!(m.determine_batch_hint("A"), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hint_never_allows_exceeding_cap() {
        let m = manager(100, 30);
        let mut total = 0;
        let mut previous = usize::MAX;

        loop {
            let hint = m.determine_batch_hint("A");
            assert!(hint <= previous);
            previous = hint;
            if hint == 0 {
                break;
            }
            m.update_num_docs_traversed("A", hint);
            total += hint;
            assert!(total <= 100);
        }

        assert_eq!(total, 100);
        assert_eq!(m.docs_in_period("A"), Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_period_resets_consumption() {
        let m = manager(100, 500);
        m.determine_batch_hint("A");
        m.update_num_docs_traversed("A", 100);
        assert_eq!(m.determine_batch_hint("A"), 0);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(m.determine_batch_hint("A"), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(m.determine_batch_hint("A"), 100);
        assert_eq!(m.docs_in_period("A"), Some(0));
    }

    #[test]
    fn test_sources_are_independent() {
        let m = manager(100, 500);
        m.determine_batch_hint("A");
        m.determine_batch_hint("B");
        m.update_num_docs_traversed("A", 100);

        assert_eq!(m.determine_batch_hint("A"), 0);
        assert_eq!(m.determine_batch_hint("B"), 100);
    }

    #[test]
    fn test_set_max_load_overrides_default() {
        let m = manager(100, 500);
        m.set_max_load("big", 400);
        assert_eq!(m.determine_batch_hint("big"), 400);
        assert_eq!(m.determine_batch_hint("small"), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown() {
        let m = manager(100, 500);
        m.determine_batch_hint("A");
        assert!(!m.should_delay("A"));

        m.connector_finished_traversal("A", Duration::from_secs(10));
        assert!(m.should_delay("A"));
        assert_eq!(m.remaining_delay("A"), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!m.should_delay("A"));
        assert_eq!(m.remaining_delay("A"), None);
    }

    #[test]
    fn test_zero_wait_clears_cooldown() {
        let m = manager(100, 500);
        m.determine_batch_hint("A");
        m.connector_finished_traversal("A", Duration::from_secs(600));
        m.connector_finished_traversal("A", Duration::ZERO);
        assert!(!m.should_delay("A"));
    }

    #[test]
    fn test_removed_source_updates_are_noops() {
        let m = manager(100, 500);
        m.determine_batch_hint("A");
        m.remove_connector("A");

        m.update_num_docs_traversed("A", 50);
        m.connector_finished_traversal("A", Duration::from_secs(60));

        assert!(!m.should_delay("A"));
        assert_eq!(m.docs_in_period("A"), None);
        assert_eq!(m.determine_batch_hint("A"), 100);
    }

    #[test]
    fn test_generation_changes_across_removal() {
        let m = manager(100, 500);
        assert_eq!(m.generation("A"), None);

        m.determine_batch_hint("A");
        let first = m.generation("A").unwrap();
        m.determine_batch_hint("A");
        assert_eq!(m.generation("A"), Some(first));

        m.remove_connector("A");
        m.determine_batch_hint("A");
        assert_ne!(m.generation("A"), Some(first));
    }

    #[test]
    fn test_unknown_source_queries() {
        let m = manager(100, 500);
        assert!(!m.should_delay("ghost"));
        assert_eq!(m.last_hint("ghost"), None);
        m.remove_connector("ghost");
    }

    #[test]
    fn test_concurrent_updates() {
        let m = std::sync::Arc::new(manager(1_000_000, 500));
        m.determine_batch_hint("A");

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.update_num_docs_traversed("A", 1);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(m.docs_in_period("A"), Some(8000));
    }
}
