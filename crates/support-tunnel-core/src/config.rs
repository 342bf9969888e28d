//! Tunnel tuning constants.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::terminal::DEFAULT_CAPACITY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Timing and sizing shared by both endpoints.
///
/// Every field has a default so a config file only needs the overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Requester heartbeat period.
    pub heartbeat_interval_ms: u64,
    /// Missed intervals before health degrades.
    pub degraded_after_intervals: u32,
    /// Missed intervals before health is disconnected.
    pub disconnected_after_intervals: u32,
    /// Terminal lines retained by the aggregator.
    pub terminal_capacity: usize,
    /// Raw bytes per `serial_output` frame before chunking.
    pub max_frame_bytes: usize,
    /// Size of a single device read.
    pub read_buffer_bytes: usize,
    /// Baud rate used when the link is first opened.
    pub initial_baud: u32,
    /// How long to wait for subscribe confirmation.
    pub subscribe_timeout_ms: u64,
    /// Bytes written per flash chunk; also the abort granularity.
    pub flash_chunk_bytes: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            degraded_after_intervals: 2,
            disconnected_after_intervals: 6,
            terminal_capacity: DEFAULT_CAPACITY,
            max_frame_bytes: 100 * 1024,
            read_buffer_bytes: 4096,
            initial_baud: 115_200,
            subscribe_timeout_ms: 10_000,
            flash_chunk_bytes: 16 * 1024,
        }
    }
}

impl TunnelConfig {
    /// Load overrides from a JSON file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }
}
