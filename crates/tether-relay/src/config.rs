//! Relay configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Seconds a subscriber-less topic may stay untouched before the
    /// sweep removes it.
    pub idle_secs: u64,
    /// Seconds between eviction sweeps.
    pub sweep_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl RelayConfig {
    /// Idle window as a duration.
    pub fn idle_window(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            idle_secs: 60,
            sweep_secs: 10,
            max_message_size: 1024 * 1024, // 1 MB
        }
    }
}
