//! Engine configuration.
//!
//! Loaded from TOML (or built programmatically in tests). Every field has a
//! default so a partial config file is valid.

use serde::{Deserialize, Serialize};

/// Tunables for the orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How often the retry scheduler polls for due jobs, in seconds.
    pub poll_interval_secs: u64,
    /// Base delay for the exponential backoff schedule, in seconds.
    pub retry_base_delay_secs: u64,
    /// Upper bound on any single backoff delay, in seconds.
    pub retry_max_delay_secs: u64,
    /// Wall-clock budget for a single handler invocation, in seconds.
    pub step_timeout_secs: u64,
    /// Age after which a claimed-but-unfinished job is considered orphaned
    /// and its claim is reset.
    pub stale_claim_secs: u64,
    /// Capacity of the broadcast channel behind the event bus.
    pub event_bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            retry_base_delay_secs: 2,
            retry_max_delay_secs: 300,
            step_timeout_secs: 60,
            stale_claim_secs: 600,
            event_bus_capacity: 256,
        }
    }
}
