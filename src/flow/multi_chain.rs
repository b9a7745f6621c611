//! The dense `G × G` array of chains. Every chain is a homogeneous
//! `BlockChain` behind its own writer lock; cross-chain code locks one
//! chain at a time, never two.

use std::sync::{Arc, RwLock};

use crate::config::BrokerConfig;
use crate::core::params::ConsensusParams;
use crate::core::types::*;
use crate::flow::block_chain::BlockChain;
use crate::flow::FlowError;
use crate::state::CheckpointStore;
use crate::storage::Stores;

pub struct MultiChain {
    chains: Vec<RwLock<BlockChain>>,
    params: ConsensusParams,
    broker: BrokerConfig,
}

impl MultiChain {
    pub fn new(
        params: ConsensusParams,
        broker: BrokerConfig,
        stores: Arc<Stores>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Result<Self, FlowError> {
        let mut chains = Vec::with_capacity(params.chain_count());
        for flat in 0..params.chain_count() {
            let chain_index = ChainIndex::from_flat_index(flat, params.groups);
            chains.push(RwLock::new(BlockChain::new(
                chain_index,
                params.clone(),
                stores.clone(),
                checkpoints.clone(),
            )?));
        }
        Ok(MultiChain { chains, params, broker })
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn broker(&self) -> &BrokerConfig {
        &self.broker
    }

    pub fn chain_lock(&self, chain_index: ChainIndex) -> &RwLock<BlockChain> {
        &self.chains[chain_index.flat_index(self.params.groups)]
    }

    /// Run a closure against one chain under its read lock
    pub fn read<R>(&self, chain_index: ChainIndex, f: impl FnOnce(&BlockChain) -> R) -> R {
        f(&self.chain_lock(chain_index).read().unwrap())
    }

    /// Run a closure against one chain under its write lock
    pub fn write<R>(&self, chain_index: ChainIndex, f: impl FnOnce(&mut BlockChain) -> R) -> R {
        f(&mut self.chain_lock(chain_index).write().unwrap())
    }

    pub fn owned_chains(&self) -> Vec<ChainIndex> {
        self.broker.owned_chains()
    }

    // ─── Aggregations (broker-owned chains only) ────────────────────

    pub fn num_hashes(&self) -> usize {
        self.owned_chains()
            .into_iter()
            .map(|ci| self.read(ci, |c| c.header_chain().hash_chain().num_hashes()))
            .sum()
    }

    /// Headers of owned-chain blocks whose timestamps fall in the range,
    /// each paired with its height
    pub fn get_heighted_block_headers(
        &self,
        from_ms: u64,
        until_ms: u64,
    ) -> Vec<(u64, BlockHeader)> {
        let mut out = Vec::new();
        for ci in self.owned_chains() {
            self.read(ci, |chain| {
                let hashes = chain
                    .header_chain()
                    .hash_chain()
                    .hashes_in_time_range(from_ms, until_ms);
                for hash in hashes {
                    let height = chain.header_chain().hash_chain().get_height(&hash).unwrap();
                    if let Some(header) = chain.header_chain().get_header(&hash) {
                        out.push((height, header.clone()));
                    }
                }
            });
        }
        out
    }
}
