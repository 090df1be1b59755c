//! Gossip engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default key under which each member's membership tag is stored.
pub const DEFAULT_SWIM_TAG_KEY: &str = "_swim_tag";

/// Gossip engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Interval between probe rounds; also the base unit for suspicion and
    /// leaving-node retention windows.
    pub gossip_period: Duration,

    /// Number of members probed per round.
    pub gossip_fanout: usize,

    /// Number of proxies asked to probe indirectly after a direct ping
    /// timeout.
    pub ping_proxies_count: usize,

    /// Multiplier applied to the proxy round-trip estimate to form the
    /// indirect-probe timeout.
    pub min_ping_req_timeout_times: u32,

    /// Minimum surviving members per region; DEAD members are only removed
    /// above this floor.
    pub min_region_peer: usize,

    /// Key carrying the membership tag.
    pub swim_tag_key: String,

    /// Region of the local node.
    pub region: String,

    /// Disable the periodic probe loop.
    pub disable_failure_detect: bool,

    /// Disable the periodic suspicion-expiry loop.
    pub disable_clear_suspicions: bool,

    /// Use measured round-trip times for probe timeouts instead of pinning
    /// them to the gossip period.
    pub use_estimated_rtt: bool,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_period: Duration::from_secs(1),
            gossip_fanout: 3,
            ping_proxies_count: 3,
            min_ping_req_timeout_times: 2,
            min_region_peer: 1,
            swim_tag_key: DEFAULT_SWIM_TAG_KEY.to_string(),
            region: String::new(),
            disable_failure_detect: false,
            disable_clear_suspicions: false,
            use_estimated_rtt: false,
        }
    }
}

impl GossipConfig {
    /// Set the local node's region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Set the probe round interval.
    pub fn with_gossip_period(mut self, period: Duration) -> Self {
        self.gossip_period = period;
        self
    }

    /// Set the per-region membership floor.
    pub fn with_min_region_peer(mut self, min: usize) -> Self {
        self.min_region_peer = min;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GossipConfig::default();
        assert_eq!(config.gossip_period, Duration::from_secs(1));
        assert_eq!(config.swim_tag_key, DEFAULT_SWIM_TAG_KEY);
        assert!(!config.disable_failure_detect);
        assert!(!config.use_estimated_rtt);
    }

    #[test]
    fn test_builder_helpers() {
        let config = GossipConfig::default()
            .with_region("rack-a")
            .with_gossip_period(Duration::from_millis(200))
            .with_min_region_peer(2);
        assert_eq!(config.region, "rack-a");
        assert_eq!(config.gossip_period, Duration::from_millis(200));
        assert_eq!(config.min_region_peer, 2);
    }
}
