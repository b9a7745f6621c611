//! Block chain: the header chain plus block bodies and world-state
//! checkpoints.
//!
//! `add` is the single write path for a chain. It validates structure and
//! proof-of-work, replays the transactions in the deterministic execution
//! order against the parent's world state, and only then touches the
//! header index and the persistent stores. A block that fails anywhere is
//! rejected whole.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::params::{block_reward, genesis_block, ConsensusParams};
use crate::core::types::*;
use crate::flow::header_chain::HeaderChain;
use crate::flow::FlowError;
use crate::miner::non_coinbase_execution_order;
use crate::pow::hash_meets_target;
use crate::state::{CheckpointStore, WorldState};
use crate::storage::{BlockStateRecord, ChainStateRecord, Stores};

pub struct BlockChain {
    headers: HeaderChain,
    bodies: HashMap<Hash256, Block>,
    /// block hash -> world-state root after executing that block
    state_roots: HashMap<Hash256, Hash256>,
    checkpoints: Arc<CheckpointStore>,
    stores: Arc<Stores>,
    chain_index: ChainIndex,
    params: ConsensusParams,
    /// Bumped on every accepted block; BlockFlow snapshots this to detect
    /// a chain moving under a cross-chain computation
    sequence: u64,
}

impl BlockChain {
    pub fn new(
        chain_index: ChainIndex,
        params: ConsensusParams,
        stores: Arc<Stores>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Result<Self, FlowError> {
        let genesis = genesis_block(chain_index, &params);
        let genesis_hash = genesis.hash();

        let mut state = WorldState::new();
        for tx in &genesis.transactions {
            state = state.apply(tx).map_err(|e| FlowError::InvalidExecution(e.to_string()))?;
        }
        let root = checkpoints.commit(&state).map_err(FlowError::from_storage)?;

        let headers = HeaderChain::new(chain_index, &genesis.header, params.clone());
        let mut bodies = HashMap::new();
        bodies.insert(genesis_hash, genesis.clone());
        let mut state_roots = HashMap::new();
        state_roots.insert(genesis_hash, root);

        stores
            .put_block_commit(
                &genesis_hash,
                &genesis,
                &BlockStateRecord {
                    height: 0,
                    weight: crate::pow::target_to_work(genesis.header.target),
                    world_state_root: root,
                },
            )
            .map_err(FlowError::from_storage)?;
        stores.put_trie_hash(&genesis_hash, &root).map_err(FlowError::from_storage)?;

        Ok(BlockChain {
            headers,
            bodies,
            state_roots,
            checkpoints,
            stores,
            chain_index,
            params,
            sequence: 0,
        })
    }

    pub fn chain_index(&self) -> ChainIndex {
        self.chain_index
    }

    pub fn header_chain(&self) -> &HeaderChain {
        &self.headers
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    // ─── Block Acceptance ───────────────────────────────────────────

    pub fn add(&mut self, block: &Block) -> Result<Hash256, FlowError> {
        let hash = block.hash();

        if self.bodies.contains_key(&hash) {
            return Err(FlowError::DuplicateBlock);
        }
        if block.header.chain_index(self.params.groups) != self.chain_index {
            return Err(FlowError::InvalidChainIndex);
        }
        if !hash_meets_target(&hash, block.header.target) {
            return Err(FlowError::InvalidPow);
        }
        if !block.validate_txs_root() {
            return Err(FlowError::InvalidTxsRoot);
        }
        match block.coinbase() {
            Some(cb) if cb.is_coinbase() => {}
            _ => return Err(FlowError::InvalidCoinbase),
        }
        if block.non_coinbase().iter().any(|tx| tx.is_coinbase()) {
            return Err(FlowError::InvalidCoinbase);
        }

        let parent_hash = block.header.parent().ok_or(FlowError::MissingParent)?;
        let parent_root = *self
            .state_roots
            .get(&parent_hash)
            .ok_or(FlowError::MissingBlock(parent_hash))?;
        let mut state = self
            .checkpoints
            .get(&parent_root)
            .map_err(FlowError::from_storage)?
            .ok_or(FlowError::MissingBlock(parent_hash))?;

        // Replay user txs in the deterministic execution order, then the
        // coinbase. Fees accumulate as input-minus-output along the way.
        let user_txs = block.non_coinbase();
        let order = non_coinbase_execution_order(&parent_hash, user_txs);
        let mut fees: u64 = 0;
        for i in order {
            let tx = &user_txs[i];
            self.validate_tx_signatures(tx, &state)?;
            let input_sum: u64 = tx
                .unsigned
                .inputs
                .iter()
                .filter_map(|r| state.get(r))
                .map(|o| o.amount)
                .sum();
            let output_sum = tx.total_output();
            if output_sum > input_sum {
                return Err(FlowError::InvalidExecution("outputs exceed inputs".into()));
            }
            fees += input_sum - output_sum;
            state = state
                .apply(tx)
                .map_err(|e| FlowError::InvalidExecution(e.to_string()))?;
        }

        let coinbase = block.coinbase().unwrap();
        let parent_height = self.headers.hash_chain().get_height(&parent_hash).unwrap_or(0);
        let reward = block_reward(parent_height + 1);
        if coinbase.total_output() > reward + fees {
            return Err(FlowError::InvalidCoinbase);
        }
        state = state
            .apply(coinbase)
            .map_err(|e| FlowError::InvalidExecution(e.to_string()))?;

        // All validation passed: index the header, checkpoint the state,
        // and persist the lot
        self.headers.add(&block.header)?;
        let root = self.checkpoints.commit(&state).map_err(FlowError::from_storage)?;
        self.state_roots.insert(hash, root);
        self.bodies.insert(hash, block.clone());
        self.sequence += 1;

        let chain = self.headers.hash_chain();
        let record = BlockStateRecord {
            height: chain.get_height(&hash).unwrap(),
            weight: chain.get_weight(&hash).unwrap(),
            world_state_root: root,
        };
        self.stores
            .put_block_commit(&hash, block, &record)
            .map_err(FlowError::from_storage)?;
        self.stores.put_trie_hash(&hash, &root).map_err(FlowError::from_storage)?;
        self.stores
            .put_chain_state(
                self.chain_index.flat_index(self.params.groups),
                &ChainStateRecord {
                    tips: chain.tips_sorted(),
                    best_tip: chain.best_tip(),
                },
            )
            .map_err(FlowError::from_storage)?;

        tracing::debug!(
            "📦 Chain {} accepted block {} at height {}",
            self.chain_index,
            hex::encode(&hash[..8]),
            record.height,
        );
        Ok(hash)
    }

    /// Every input must be present in the state, locked to the hash of the
    /// pubkey whose signature covers the tx id. Script bodies themselves
    /// execute in the external VM.
    fn validate_tx_signatures(&self, tx: &Transaction, state: &WorldState) -> Result<(), FlowError> {
        let tx_hash = tx.hash();
        for (i, input) in tx.unsigned.inputs.iter().enumerate() {
            let output = state.get(input).ok_or_else(|| {
                FlowError::InvalidExecution(format!("input {} not in world state", i))
            })?;
            let sig = tx.signatures.get(i).ok_or_else(|| {
                FlowError::InvalidExecution(format!("input {} missing signature", i))
            })?;
            if &crate::crypto::pubkey_bytes_to_hash(&sig.pubkey) != output.lockup.p2pkh_hash() {
                return Err(FlowError::InvalidExecution(format!("input {} pubkey mismatch", i)));
            }
            if !crate::crypto::verify_signature(&sig.pubkey, &tx_hash, &sig.signature) {
                return Err(FlowError::InvalidExecution(format!("input {} bad signature", i)));
            }
        }
        Ok(())
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.bodies.contains_key(hash)
    }

    pub fn get_block(&self, hash: &Hash256) -> Option<&Block> {
        self.bodies.get(hash)
    }

    pub fn blocks_by_hashes(&self, hashes: &[Hash256]) -> Vec<Block> {
        hashes.iter().filter_map(|h| self.bodies.get(h).cloned()).collect()
    }

    /// World state as of (after executing) the given block
    pub fn world_state_at(&self, hash: &Hash256) -> Result<WorldState, FlowError> {
        let root = self.state_roots.get(hash).ok_or(FlowError::MissingBlock(*hash))?;
        self.checkpoints
            .get(root)
            .map_err(FlowError::from_storage)?
            .ok_or(FlowError::MissingBlock(*hash))
    }

    pub fn state_root_of(&self, hash: &Hash256) -> Option<Hash256> {
        self.state_roots.get(hash).copied()
    }

    pub fn next_target_after(&self, parent: &Hash256) -> Result<u32, FlowError> {
        self.headers.next_target_after(parent)
    }

    pub fn best_tip(&self) -> Hash256 {
        self.headers.hash_chain().best_tip()
    }
}
