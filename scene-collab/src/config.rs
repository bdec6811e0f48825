//! Engine and gateway configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::scene::Vec3;

/// Tunables shared by every workspace the coordinator hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lifetime of an object lock that is never released explicitly
    pub lock_ttl: Duration,
    /// Maximum undo entries kept per workspace (oldest evicted)
    pub history_capacity: usize,
    /// History entries included in a snapshot
    pub snapshot_history_len: usize,
    /// Minimum spacing between cursor broadcasts of one participant
    pub cursor_throttle: Duration,
    /// Center distance under which group selection pulls in neighbours
    pub connectivity_radius: f32,
    /// Translation applied by `clone` when the request gives none
    pub clone_offset: Vec3,
    /// Pending commands buffered per workspace actor
    pub command_queue_capacity: usize,
    /// Events buffered per subscriber before it starts lagging
    pub broadcast_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            history_capacity: 100,
            snapshot_history_len: 10,
            cursor_throttle: Duration::from_millis(100),
            connectivity_radius: 2.0,
            clone_offset: Vec3::new(1.0, 0.0, 0.0),
            command_queue_capacity: 1024,
            broadcast_capacity: 256,
        }
    }
}

/// WebSocket gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub engine: EngineConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.snapshot_history_len, 10);
        assert_eq!(config.cursor_throttle, Duration::from_millis(100));
        assert_eq!(config.connectivity_radius, 2.0);
        assert_eq!(config.clone_offset, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_gateway_default_bind() {
        let config = GatewayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.engine, EngineConfig::default());
    }
}
