//! Relay configuration management

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Packets buffered between a reader and its writer
    #[serde(default = "RelayConfig::default_queue_capacity")]
    pub queue_capacity: usize,
    /// Upper bound, in milliseconds, on how long a worker blocks before
    /// re-checking its stop flag
    #[serde(default = "RelayConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Tick a TTY spinner while proxy connects are being retried
    #[serde(default = "RelayConfig::default_spinner")]
    pub spinner: bool,
    /// Default log filter when RUST_LOG is unset
    #[serde(default = "RelayConfig::default_log_level")]
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: Self::default_queue_capacity(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            spinner: Self::default_spinner(),
            log_level: Self::default_log_level(),
        }
    }
}

impl RelayConfig {
    fn default_queue_capacity() -> usize {
        256
    }

    fn default_poll_interval_ms() -> u64 {
        100
    }

    fn default_spinner() -> bool {
        true
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    /// The worker polling tick as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Default config location: `<config dir>/usb-mitm/relay.toml`
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-mitm").join("relay.toml")
        } else {
            PathBuf::from(".config/usb-mitm/relay.toml")
        }
    }

    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: RelayConfig = toml::from_str(&text)
            .map_err(|e| RelayError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(RelayError::Config(
                "queue_capacity must be positive".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(RelayError::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
