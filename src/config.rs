//! Agent configuration parameters
//!
//! All tunable parameters for the update and rotation agents.
//! Values can be overridden via NVS; see [`crate::adapters::nvs`].

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::ports::ConfigError;

/// Largest block the stream service will hand out.
pub const MAX_BLOCK_SIZE: u32 = 2048;
/// Smallest block size worth the per-request overhead.
pub const MIN_BLOCK_SIZE: u32 = 256;
/// Maximum length of the CSR subject string.
pub const SUBJECT_CAPACITY: usize = 64;

/// Core agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    // --- Download ---
    /// Bytes requested per stream block
    pub block_size: u32,
    /// Largest image or patch the device will accept (bytes)
    pub max_file_size: u32,
    /// Page size used by the patch engine for each of its three streams
    pub patch_window: u32,

    // --- Timing ---
    /// Event queue receive timeout; doubles as the cooperative yield period
    pub queue_timeout_ms: u32,
    /// How long to wait for the broker to acknowledge a packet
    pub ack_timeout_ms: u32,

    // --- Reconnection ---
    pub backoff_base_ms: u32,
    pub backoff_max_ms: u32,
    pub max_connect_attempts: u8,
    pub mqtt_port: u16,

    // --- Identity ---
    /// Subject used for generated signing requests
    pub csr_subject: heapless::String<SUBJECT_CAPACITY>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let mut csr_subject = heapless::String::new();
        // Fits SUBJECT_CAPACITY.
        let _ = csr_subject.push_str("CN=fleetnode");
        Self {
            block_size: 1024,
            max_file_size: 1_945_600, // 1.9 MiB
            patch_window: 4096,

            queue_timeout_ms: 1000,
            ack_timeout_ms: 1000,

            backoff_base_ms: 500,
            backoff_max_ms: 5000,
            max_connect_attempts: 5,
            mqtt_port: 8883,

            csr_subject,
        }
    }
}

impl AgentConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.queue_timeout_ms))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.ack_timeout_ms))
    }

    /// Number of blocks needed to carry `file_size` bytes.
    pub fn block_count(&self, file_size: u32) -> u32 {
        file_size.div_ceil(self.block_size)
    }
}

/// Range-check every field.  Invalid values are rejected, never clamped.
pub fn validate_config(cfg: &AgentConfig) -> Result<(), ConfigError> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&cfg.block_size) {
        return Err(ConfigError::ValidationFailed(
            "block_size must be 256–2048",
        ));
    }
    if cfg.max_file_size < cfg.block_size {
        return Err(ConfigError::ValidationFailed(
            "max_file_size must be at least one block",
        ));
    }
    if !(256..=16384).contains(&cfg.patch_window) {
        return Err(ConfigError::ValidationFailed(
            "patch_window must be 256–16384",
        ));
    }
    if !(10..=60_000).contains(&cfg.queue_timeout_ms) {
        return Err(ConfigError::ValidationFailed(
            "queue_timeout_ms must be 10–60000",
        ));
    }
    if !(100..=30_000).contains(&cfg.ack_timeout_ms) {
        return Err(ConfigError::ValidationFailed(
            "ack_timeout_ms must be 100–30000",
        ));
    }
    if cfg.backoff_base_ms == 0 || cfg.backoff_base_ms > cfg.backoff_max_ms {
        return Err(ConfigError::ValidationFailed(
            "backoff_base_ms must be > 0 and <= backoff_max_ms",
        ));
    }
    if cfg.max_connect_attempts == 0 {
        return Err(ConfigError::ValidationFailed(
            "max_connect_attempts must be > 0",
        ));
    }
    if cfg.mqtt_port == 0 {
        return Err(ConfigError::ValidationFailed("mqtt_port must be non-zero"));
    }
    if cfg.csr_subject.is_empty() {
        return Err(ConfigError::ValidationFailed("csr_subject must not be empty"));
    }
    Ok(())
}
