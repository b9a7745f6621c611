//! Node configuration. Loaded from `config.json` in the data directory
//! when present; every field has a default so a missing or partial file
//! still yields a runnable node.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::params::ConsensusParams;
use crate::core::types::{ChainIndex, GroupIndex};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub broker: BrokerConfig,
    pub consensus: ConsensusParams,
    pub mempool: MempoolConfig,
    pub mining: MiningConfig,
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
}

impl NodeConfig {
    /// Read `config.json` from the data dir, falling back to defaults.
    pub fn load(data_dir: &str) -> Self {
        let path = Path::new(data_dir).join("config.json");
        match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Bad config at {}: {} — using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, data_dir: &str) -> std::io::Result<()> {
        let path = Path::new(data_dir).join("config.json");
        let json = serde_json::to_string_pretty(self).expect("config serialization failed");
        std::fs::write(path, json)
    }
}

// ─── Broker ─────────────────────────────────────────────────────────

/// Which slice of the `G × G` chains this broker owns. Brokers split the
/// group space into `broker_num` contiguous slices; a broker owns every
/// chain whose `from` group falls in its slice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub groups: u32,
    pub broker_num: u32,
    pub broker_id: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { groups: 4, broker_num: 1, broker_id: 0 }
    }
}

impl BrokerConfig {
    pub fn groups_per_broker(&self) -> u32 {
        self.groups / self.broker_num
    }

    pub fn owns_group(&self, group: GroupIndex) -> bool {
        group / self.groups_per_broker() == self.broker_id
    }

    pub fn owns_chain(&self, chain_index: ChainIndex) -> bool {
        self.owns_group(chain_index.from)
    }

    pub fn owned_groups(&self) -> impl Iterator<Item = GroupIndex> + '_ {
        let start = self.broker_id * self.groups_per_broker();
        start..start + self.groups_per_broker()
    }

    pub fn owned_chains(&self) -> Vec<ChainIndex> {
        let mut chains = Vec::new();
        for from in self.owned_groups() {
            for to in 0..self.groups {
                chains.push(ChainIndex::new(from, to));
            }
        }
        chains
    }
}

// ─── Mempool ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    pub shared_pool_capacity: usize,
    pub pending_pool_capacity: usize,
    pub tx_max_number_per_block: usize,
    pub clean_frequency_ms: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            shared_pool_capacity: 1000,
            pending_pool_capacity: 1000,
            tx_max_number_per_block: 1000,
            clean_frequency_ms: 10 * 60 * 1000,
        }
    }
}

// ─── Mining ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    pub batch_delay_ms: u64,
    pub polling_interval_ms: u64,
    pub nonce_step: u64,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self { batch_delay_ms: 50, polling_interval_ms: 2_000, nonce_step: 400 }
    }
}

// ─── Network ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_port: u16,
    pub ping_frequency_ms: u64,
    pub retry_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub ban_duration_ms: u64,
    pub penalty_forgiveness_ms: u64,
    pub penalty_frequency_ms: u64,
    pub penalty_ban_threshold: u32,
    pub num_of_sync_blocks_limit: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 9551,
            ping_frequency_ms: 10_000,
            retry_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            ban_duration_ms: 60 * 60 * 1000,
            penalty_forgiveness_ms: 10 * 60 * 1000,
            penalty_frequency_ms: 60 * 1000,
            penalty_ban_threshold: 100,
            num_of_sync_blocks_limit: 128,
        }
    }
}

// ─── Discovery ──────────────────────────────────────────────────────

/// Recognized for compatibility with full deployments; the discovery
/// service itself runs out-of-process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub scan_frequency_ms: u64,
    pub neighbors_per_group: usize,
    pub bootstrap: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { scan_frequency_ms: 60_000, neighbors_per_group: 16, bootstrap: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.broker.groups, 4);
        assert_eq!(config.consensus.tips_prune_interval, 100);
        assert_eq!(config.mempool.shared_pool_capacity, 1000);
        assert_eq!(config.network.num_of_sync_blocks_limit, 128);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"broker": {"groups": 2}}"#).unwrap();
        assert_eq!(config.broker.groups, 2);
        assert_eq!(config.broker.broker_num, 1);
        assert_eq!(config.mempool.pending_pool_capacity, 1000);
    }

    #[test]
    fn test_broker_ownership_split() {
        let broker = BrokerConfig { groups: 4, broker_num: 2, broker_id: 1 };
        assert!(!broker.owns_group(0));
        assert!(!broker.owns_group(1));
        assert!(broker.owns_group(2));
        assert!(broker.owns_group(3));
        // A broker owns the full row of chains for each owned group
        assert_eq!(broker.owned_chains().len(), 8);
        assert!(broker.owns_chain(ChainIndex::new(2, 0)));
        assert!(!broker.owns_chain(ChainIndex::new(0, 2)));
    }
}
