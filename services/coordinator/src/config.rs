//! Configuration for the coordinator service.

use anyhow::Result;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the coordinator's mailbox.
    pub mailbox_capacity: usize,

    /// Default health-check interval for new node sources, in milliseconds.
    pub default_ping_frequency_ms: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mailbox_capacity = std::env::var("GRIDPOOL_MAILBOX_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256);

        let default_ping_frequency_ms = std::env::var("GRIDPOOL_PING_FREQUENCY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10_000);

        Ok(Self {
            mailbox_capacity,
            default_ping_frequency_ms,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            default_ping_frequency_ms: 10_000,
        }
    }
}
