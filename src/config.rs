//! Sync engine configuration

use serde::{Deserialize, Serialize};

/// Tuning knobs for the sync engine and its feed client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Capacity of the feed notice channel between the feed client and
    /// the reconciliation pump
    #[serde(default = "default_notice_buffer")]
    pub notice_buffer: usize,

    /// First reconnect delay after a feed disconnect, in milliseconds
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    /// Upper bound for the reconnect backoff, in milliseconds
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            notice_buffer: default_notice_buffer(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
        }
    }
}

fn default_notice_buffer() -> usize {
    256
}

fn default_reconnect_initial() -> u64 {
    250
}

fn default_reconnect_max() -> u64 {
    15_000
}
