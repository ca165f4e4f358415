//! Scheduler integration tests
//!
//! Runs the real tick loop against in-memory sources and simulated jobs.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use traversal_scheduler::config::Config;
use traversal_scheduler::domain::Schedule;
use traversal_scheduler::scheduler::{SchedulerState, SourceContext, TraversalScheduler};
use traversal_scheduler::source::{MemorySourceRegistry, SimulatedJob};

fn load_config(yaml: &str) -> Config {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("traversal-scheduler.yml");
    fs::write(&path, yaml).unwrap();
    Config::load(Some(&path)).unwrap()
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

/// A source with polling disabled is traversed in batches until drained,
/// then switched off.
#[tokio::test]
async fn test_traversal_runs_to_completion_and_disables() {
    let config = load_config(
        r#"
scheduler:
  tick_interval_ms: 5
load:
  default_max_load: 1000000
  batch_size: 50
"#,
    );

    let registry = Arc::new(MemorySourceRegistry::new());
    let job = Arc::new(SimulatedJob::new(120));
    let schedule: Schedule = "docs:0:-1:0-24".parse().unwrap();
    registry.add_source(schedule, job.clone());

    let scheduler = TraversalScheduler::new(&config, SourceContext::from_registry(registry.clone())).unwrap();
    scheduler.init().unwrap();

    wait_until("schedule to be disabled", || {
        registry.schedule("docs").map(|s| s.disabled).unwrap_or(false)
    })
    .await;

    assert_eq!(job.remaining(), 0);
    assert_eq!(job.hints(), vec![50, 50, 50]);

    let batches = job.batch_count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(job.batch_count(), batches);

    assert!(scheduler.shutdown().await);
    assert_eq!(scheduler.state(), SchedulerState::Shutdown);
    assert_eq!(registry.shutdown_count(), 1);
}

/// Each source stops at its per-period cap while the other keeps going.
#[tokio::test]
async fn test_load_cap_per_source() {
    let config = load_config(
        r#"
scheduler:
  tick_interval_ms: 5
load:
  default_max_load: 30
  period_ms: 3600000
  batch_size: 500
"#,
    );

    let registry = Arc::new(MemorySourceRegistry::new());
    let a = Arc::new(SimulatedJob::new(100));
    let b = Arc::new(SimulatedJob::new(100));
    registry.add_source("a:10:0:0-24".parse().unwrap(), a.clone());
    registry.add_source("b:0:0:0-24".parse().unwrap(), b.clone());

    let scheduler = TraversalScheduler::new(&config, SourceContext::from_registry(registry.clone())).unwrap();
    scheduler.init().unwrap();

    let load = scheduler.load_manager().clone();
    wait_until("both sources to reach the cap", || {
        load.docs_in_period("a") == Some(30) && load.docs_in_period("b") == Some(30)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(a.hints(), vec![10, 10, 10]);
    assert_eq!(b.hints(), vec![30]);
    assert_eq!(a.remaining(), 70);
    assert_eq!(b.remaining(), 70);

    assert!(scheduler.shutdown().await);
}

/// Removing a source mid-batch cancels the batch and stops scheduling it.
#[tokio::test]
async fn test_remove_source_while_running() {
    let config = load_config(
        r#"
scheduler:
  tick_interval_ms: 5
"#,
    );

    let registry = Arc::new(MemorySourceRegistry::new());
    let job = Arc::new(SimulatedJob::new(10_000).with_per_document(Duration::from_millis(10)));
    registry.add_source(Schedule::always("slow", 0), job.clone());

    let scheduler = TraversalScheduler::new(&config, SourceContext::from_registry(registry.clone())).unwrap();
    scheduler.init().unwrap();

    wait_until("batch to start", || job.batch_count() == 1).await;
    registry.remove_source("slow");
    scheduler.remove_connector("slow");

    assert_eq!(job.cancel_count(), 1);
    wait_until("batch to finish", || scheduler.in_flight() == 0).await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(job.batch_count(), 1);
    assert!(scheduler.running_sources().is_empty());

    assert!(scheduler.shutdown().await);
}

/// A source removed before its batch gets to run is never traversed.
#[tokio::test]
async fn test_remove_source_before_batch_starts() {
    let config = load_config(
        r#"
scheduler:
  tick_interval_ms: 5
"#,
    );

    let registry = Arc::new(MemorySourceRegistry::new());
    let job = Arc::new(SimulatedJob::new(10_000).with_per_document(Duration::from_millis(10)));
    registry.add_source(Schedule::always("slow", 0), job.clone());

    let scheduler = TraversalScheduler::new(&config, SourceContext::from_registry(registry.clone())).unwrap();

    // Submitted but not yet polled on this single-threaded runtime.
    assert_eq!(scheduler.tick_at(12), 1);
    registry.remove_source("slow");
    scheduler.remove_connector("slow");

    wait_until("batch to finish", || scheduler.in_flight() == 0).await;
    assert_eq!(job.batch_count(), 0);
    assert_eq!(job.remaining(), 10_000);
    assert!(scheduler.running_sources().is_empty());
    assert_eq!(scheduler.load_manager().docs_in_period("slow"), None);

    assert!(scheduler.shutdown().await);
}

/// Shutdown interrupts a long batch and still drains within the wait.
#[tokio::test]
async fn test_shutdown_interrupts_long_batches() {
    let config = load_config(
        r#"
scheduler:
  tick_interval_ms: 5
  shutdown_wait_ms: 2000
  interrupt_on_shutdown: true
"#,
    );

    let registry = Arc::new(MemorySourceRegistry::new());
    let job = Arc::new(SimulatedJob::new(10_000).with_per_document(Duration::from_millis(10)));
    registry.add_source(Schedule::always("slow", 0), job.clone());

    let scheduler = TraversalScheduler::new(&config, SourceContext::from_registry(registry.clone())).unwrap();
    scheduler.init().unwrap();
    wait_until("batch to start", || job.batch_count() == 1).await;

    assert!(scheduler.shutdown().await);
    assert_eq!(job.cancel_count(), 1);
    assert_eq!(scheduler.in_flight(), 0);
    assert!(scheduler.init().is_err());
}
