//! Engine tunables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_epoch_ring_size() -> usize {
    4096
}

fn default_epoch_tick_ms() -> u64 {
    10
}

/// Runtime configuration for the engine.
///
/// The epoch safety interval is deliberately not configurable; the
/// reclamation correctness argument assumes the constant gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of slots in the epoch ring.
    #[serde(default = "default_epoch_ring_size")]
    pub epoch_ring_size: usize,

    /// Milliseconds between epoch advances.
    #[serde(default = "default_epoch_tick_ms")]
    pub epoch_tick_ms: u64,
}

impl EngineConfig {
    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            epoch_ring_size: default_epoch_ring_size(),
            epoch_tick_ms: default_epoch_tick_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.epoch_ring_size, 4096);
        assert_eq!(config.epoch_tick(), Duration::from_millis(10));
    }

    #[test]
    fn partial_config_files_fall_back_to_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"epoch_tick_ms": 5}"#).unwrap();
        assert_eq!(config.epoch_tick_ms, 5);
        assert_eq!(config.epoch_ring_size, 4096);

        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.epoch_tick_ms, 10);
    }
}
