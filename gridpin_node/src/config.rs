use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodeConfig {
    /// Hard cap on requested pin durations, in seconds. Longer (or
    /// infinite) leases are clamped to this. `None` means uncapped.
    pub max_pin_duration_secs: Option<u64>,

    /// Interval between reconciliation sweeps, in seconds.
    pub sweep_interval_secs: u64,

    /// Timeout applied to each individual remote worker step, in
    /// seconds. A step that does not answer in time counts as failed.
    pub remote_timeout_secs: u64,

    /// Safety margin added to pool-side marker lifetimes so the marker
    /// outlives the logical expiry even under clock drift, in seconds.
    pub sticky_margin_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_pin_duration_secs: None,
            sweep_interval_secs: 60,
            remote_timeout_secs: 30,
            sticky_margin_secs: 30 * 60,
        }
    }
}

impl NodeConfig {
    pub fn max_pin_duration(&self) -> Option<Duration> {
        self.max_pin_duration_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn sticky_margin(&self) -> Duration {
        Duration::from_secs(self.sticky_margin_secs)
    }
}
