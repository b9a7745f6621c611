/// MeshForge chain parameters.
/// All consensus-critical constants are defined here.
use serde::{Deserialize, Serialize};

use crate::core::types::*;

/// Base unit denomination (like satoshis for Bitcoin)
pub const COIN: u64 = 100_000_000;

/// Maximum total supply across all shard groups
pub const MAX_SUPPLY: u64 = 84_000_000 * COIN;

/// Initial block reward per chain: 2.5 coins.
/// With G² chains producing in parallel, the aggregate emission matches a
/// single-chain ledger paying 40 coins per expected-time-span.
pub const INITIAL_BLOCK_REWARD: u64 = 2 * COIN + COIN / 2;

/// Halving interval in per-chain block heights
pub const HALVING_INTERVAL: u64 = 2_100_000;

/// Maximum block size in bytes (2 MB)
pub const MAX_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Genesis block timestamp (2025-01-01 00:00:00 UTC), in ms
pub const GENESIS_TIMESTAMP_MS: u64 = 1_735_689_600_000;

/// Protocol version — increment when chain format changes
pub const PROTOCOL_VERSION: u32 = 1;

/// Network magic bytes for testnet
pub const TESTNET_MAGIC: [u8; 4] = [0x4D, 0x45, 0x53, 0x48];

/// Calculate the per-chain block reward at a given height
pub fn block_reward(height: u64) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_BLOCK_REWARD >> halvings
}

// ─── Consensus Parameters ───────────────────────────────────────────

/// Tunable consensus parameters. Carried by value through the chain
/// components so tests can run reduced-group topologies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    /// Number of shard groups; the ledger has `groups²` chains
    pub groups: u32,
    /// Tip-set entries older than `best_tip_height - this` are dropped
    pub tips_prune_interval: u64,
    pub block_cache_capacity_per_chain: usize,
    /// Window length for the timestamp median (odd, typically 17)
    pub median_time_interval: usize,
    /// Target spacing between the two window medians, in ms
    pub expected_time_span_ms: u64,
    pub time_span_min_ms: u64,
    pub time_span_max_ms: u64,
    /// Compact encoding of the easiest permitted target
    pub max_mining_target: u32,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            groups: 4,
            tips_prune_interval: 100,
            block_cache_capacity_per_chain: 25,
            median_time_interval: 17,
            expected_time_span_ms: 64_000,
            time_span_min_ms: 16_000,
            time_span_max_ms: 256_000,
            max_mining_target: 0x2100ffff,
        }
    }
}

impl ConsensusParams {
    pub fn chain_count(&self) -> usize {
        (self.groups * self.groups) as usize
    }

    pub fn dep_count(&self) -> usize {
        2 * self.groups as usize - 1
    }

    /// Reduced topology used by tests and local development
    pub fn with_groups(groups: u32) -> Self {
        Self { groups, ..Self::default() }
    }
}

// ─── Genesis ────────────────────────────────────────────────────────

/// Build the genesis block for one chain. Genesis blocks carry no deps,
/// sit at height 0, and pay the initial reward to an unspendable lockup.
/// Each chain's genesis differs through the chain id baked into the
/// coinbase script so the G² genesis hashes are distinct.
pub fn genesis_block(chain_index: ChainIndex, params: &ConsensusParams) -> Block {
    let mut tag = Vec::with_capacity(8);
    tag.extend_from_slice(&chain_index.from.to_le_bytes());
    tag.extend_from_slice(&chain_index.to.to_le_bytes());
    let coinbase = Transaction {
        unsigned: UnsignedTx {
            inputs: Vec::new(),
            fixed_outputs: vec![TxOutput {
                amount: block_reward(0),
                lockup: LockupScript::P2pkh(NULL_HASH),
            }],
            script: Some(tag),
        },
        signatures: Vec::new(),
        generated_outputs: Vec::new(),
    };
    let transactions = vec![coinbase];
    Block {
        header: BlockHeader {
            deps: BlockDeps::empty(),
            txs_root: Block::compute_txs_root(&transactions),
            timestamp_ms: GENESIS_TIMESTAMP_MS,
            target: params.max_mining_target,
            nonce: 0,
        },
        transactions,
    }
}
