//! Scheduler configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest allowed worker ceiling.
pub const MIN_WORKERS: usize = 1;
/// Largest allowed worker ceiling.
pub const MAX_WORKERS: usize = 100;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("max_workers must be between 1 and 100, got {0}")]
    MaxWorkers(usize),

    #[error("default_max_instances must be positive")]
    DefaultMaxInstances,
}

/// Tunables for a [`crate::Scheduler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Global ceiling on concurrently executing job bodies.
    pub max_workers: usize,
    /// `max_instances` for jobs that don't set one.
    pub default_max_instances: u32,
    /// `misfire_grace_seconds` for jobs that don't set one.
    pub default_misfire_grace_seconds: u64,
    /// How long shutdown waits for running bodies before aborting them.
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 20,
            default_max_instances: 1,
            default_misfire_grace_seconds: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

impl SchedulerConfig {
    /// Load and validate a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.max_workers) {
            return Err(ConfigError::MaxWorkers(self.max_workers));
        }
        if self.default_max_instances == 0 {
            return Err(ConfigError::DefaultMaxInstances);
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
