//! Monitor configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use types::{DeviceFilter, Error, Result};

/// Polling intervals below this floor fall back to the default.
pub const MIN_POLLING_INTERVAL_MS: u64 = 100;
/// Default polling interval.
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Re-enumerate periodically as a fallback for unreliable attach
    /// notifications
    #[serde(default)]
    pub polling_enabled: bool,
    /// Polling period in milliseconds (floor 100)
    #[serde(default = "MonitorConfig::default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// Capacity of the worker event queue
    #[serde(default = "MonitorConfig::default_queue_capacity")]
    pub queue_capacity: usize,
    /// Initial device filter set, in evaluation order
    #[serde(default)]
    pub filters: Vec<DeviceFilter>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            polling_enabled: false,
            polling_interval_ms: Self::default_polling_interval_ms(),
            queue_capacity: Self::default_queue_capacity(),
            filters: Vec::new(),
        }
    }
}

impl MonitorConfig {
    fn default_polling_interval_ms() -> u64 {
        DEFAULT_POLLING_INTERVAL_MS
    }

    fn default_queue_capacity() -> usize {
        256
    }

    /// Load a configuration from a TOML file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        Ok(config.validate())
    }

    /// Clamp out-of-range values to usable ones.
    pub fn validate(mut self) -> Self {
        if self.polling_interval_ms < MIN_POLLING_INTERVAL_MS {
            self.polling_interval_ms = DEFAULT_POLLING_INTERVAL_MS;
        }
        if self.queue_capacity == 0 {
            self.queue_capacity = Self::default_queue_capacity();
        }
        self
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }
}
