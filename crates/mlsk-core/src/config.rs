//! Configuration resolution for the MLSK engine.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Config file (explicit path, or `$XDG_CONFIG_HOME/mlsk/engine.json`)
//! 3. Environment variables
//! 4. CLI arguments (applied by the binary, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Complete MLSK configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool and monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of long-lived worker slots.
    pub worker_count: usize,
    /// Bounded capacity of the shared task queue.
    pub task_queue_capacity: usize,
    /// Seconds between two monitor ticks.
    pub monitor_interval_secs: u64,
    /// Seconds a worker may stay BUSY without a transition before it is reported.
    pub stuck_threshold_secs: u64,
    /// Delay after a forced restart before the new worker is considered usable.
    pub restart_settle_millis: u64,
    /// How long a retired worker may take to stop before its thread is detached.
    pub terminate_grace_millis: u64,
    /// Whether the monitor inspects workers right after startup.
    pub monitor_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            task_queue_capacity: 8,
            monitor_interval_secs: 20,
            stuck_threshold_secs: 40,
            restart_settle_millis: 1000,
            terminate_grace_millis: 500,
            monitor_enabled: true,
        }
    }
}

impl EngineConfig {
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub const fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub const fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_millis)
    }

    pub const fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_millis)
    }

    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::Config("worker_count must be at least 1".to_string()));
        }
        if self.task_queue_capacity == 0 {
            return Err(Error::Config(
                "task_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.monitor_interval_secs == 0 {
            return Err(Error::Config(
                "monitor_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` must exist; the default location is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => match default_config_path() {
            Some(default_path) if default_path.exists() => load_config_file(&default_path)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.engine.validate()?;
    Ok(config)
}

/// Get the default config file path.
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        .map(|p| p.join("mlsk").join("engine.json"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).inspect_err(|e| {
        warn!(path = %path.display(), error = %e, "Failed to read config file");
    })?;
    let config = serde_json::from_str(&content).inspect_err(|e| {
        warn!(path = %path.display(), error = %e, "Failed to parse config file");
    })?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = lookup("MLSK_WORKER_COUNT").and_then(|v| v.parse().ok()) {
        config.engine.worker_count = n;
    }
    if let Some(n) = lookup("MLSK_TASK_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
        config.engine.task_queue_capacity = n;
    }
    if let Some(n) = lookup("MLSK_MONITOR_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        config.engine.monitor_interval_secs = n;
    }
    if let Some(n) = lookup("MLSK_STUCK_THRESHOLD_SECS").and_then(|v| v.parse().ok()) {
        config.engine.stuck_threshold_secs = n;
    }
    if let Some(level) = lookup("MLSK_LOG_LEVEL") {
        config.logging.level = level;
    }
}
