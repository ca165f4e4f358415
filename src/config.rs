//! Configuration for the traversal scheduler.
//!
//! Loaded from YAML with the fallback chain: explicit path,
//! `~/.config/traversal-scheduler/traversal-scheduler.yml`,
//! `./traversal-scheduler.yml`, then defaults.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runner::TaskRunnerConfig;
use crate::scheduler::HostLoadConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub scheduler: SchedulerConfig,
    pub load: LoadConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub maximum_task_life_ms: u64,
    pub cancel_grace_ms: u64,
    pub error_delay_ms: u64,
    pub shutdown_wait_ms: u64,
    pub interrupt_on_shutdown: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            maximum_task_life_ms: 1_800_000,
            cancel_grace_ms: 5000,
            error_delay_ms: 300_000,
            shutdown_wait_ms: 10_000,
            interrupt_on_shutdown: true,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_millis(self.error_delay_ms)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.shutdown_wait_ms)
    }

    pub fn task_runner_config(&self) -> TaskRunnerConfig {
        TaskRunnerConfig::default()
            .with_maximum_task_life(Duration::from_millis(self.maximum_task_life_ms))
            .with_cancel_grace(Duration::from_millis(self.cancel_grace_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub default_max_load: usize,
    pub period_ms: u64,
    pub batch_size: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            default_max_load: 1000,
            period_ms: 60_000,
            batch_size: 500,
        }
    }
}

impl LoadConfig {
    pub fn host_load_config(&self) -> HostLoadConfig {
        HostLoadConfig {
            default_max_load: self.default_max_load,
            period: Duration::from_millis(self.period_ms),
            batch_size: self.batch_size,
        }
    }
}

/// Simulated sources run by the host binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub sources: Vec<DemoSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoSource {
    /// Schedule string, e.g. `docs:100:5000:0-24`
    pub schedule: String,
    pub documents: usize,
    pub per_document_ms: u64,
}

impl Default for DemoSource {
    fn default() -> Self {
        Self {
            schedule: String::new(),
            documents: 1000,
            per_document_ms: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            scheduler: SchedulerConfig::default(),
            load: LoadConfig::default(),
            demo: DemoConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_name = env!("CARGO_PKG_NAME");

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
