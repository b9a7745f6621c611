//! Shared fixtures for flow-level tests: a single-broker BlockFlow over a
//! temporary store, plus helpers that craft valid blocks (deps, target,
//! coinbase, nonce ground to the right chain).

use std::sync::Arc;

use crate::config::BrokerConfig;
use crate::core::params::{block_reward, ConsensusParams};
use crate::core::types::*;
use crate::crypto::Keypair;
use crate::flow::BlockFlow;
use crate::state::WorldState;
use crate::storage::Stores;

pub struct TestFixture {
    pub flow: BlockFlow,
    pub keypair: Keypair,
    pub params: ConsensusParams,
}

impl TestFixture {
    pub fn new(groups: u32) -> Self {
        let params = ConsensusParams::with_groups(groups);
        let broker = BrokerConfig { groups, broker_num: 1, broker_id: 0 };
        let stores = Arc::new(Stores::open_temporary().unwrap());
        let flow = BlockFlow::new(params.clone(), broker, stores).unwrap();
        TestFixture { flow, keypair: Keypair::generate(), params }
    }

    pub fn best_tip(&self, ci: ChainIndex) -> Hash256 {
        self.flow.best_tip(ci)
    }

    pub fn height(&self, ci: ChainIndex, hash: &Hash256) -> Option<u64> {
        self.flow.multi_chain().read(ci, |c| c.header_chain().hash_chain().get_height(hash))
    }

    pub fn weight(&self, ci: ChainIndex, hash: &Hash256) -> Option<u128> {
        self.flow.multi_chain().read(ci, |c| c.header_chain().hash_chain().get_weight(hash))
    }

    pub fn is_tip(&self, ci: ChainIndex, hash: &Hash256) -> bool {
        self.flow.multi_chain().read(ci, |c| c.header_chain().hash_chain().is_tip(hash))
    }

    pub fn tip_count(&self, ci: ChainIndex) -> usize {
        self.flow.multi_chain().read(ci, |c| c.header_chain().hash_chain().tip_count())
    }

    pub fn world_state_at(&self, ci: ChainIndex, hash: &Hash256) -> WorldState {
        self.flow.multi_chain().read(ci, |c| c.world_state_at(hash)).unwrap()
    }

    /// The all-genesis dep vector for a block on `ci`, in header-slot order
    pub fn genesis_deps(&self, ci: ChainIndex) -> Vec<Hash256> {
        (0..self.params.dep_count())
            .map(|slot| {
                self.flow.genesis_hash(BlockDeps::slot_chain(ci, slot, self.params.groups))
            })
            .collect()
    }

    pub fn make_block(&self, ci: ChainIndex, deps: Vec<Hash256>, user_txs: Vec<Transaction>) -> Block {
        self.make_block_with_nonce_salt(ci, deps, user_txs, 0)
    }

    /// Craft a valid block: target from the parent, timestamp one expected
    /// span later, coinbase paying the fixture key, nonce ground until the
    /// hash meets the target *and* lands on `ci`. The salt de-duplicates
    /// otherwise-identical sibling blocks.
    pub fn make_block_with_nonce_salt(
        &self,
        ci: ChainIndex,
        deps: Vec<Hash256>,
        user_txs: Vec<Transaction>,
        salt: u64,
    ) -> Block {
        let parent = *deps.last().expect("deps carry at least the parent");
        let (parent_ts, parent_height, target) = self.flow.multi_chain().read(ci, |c| {
            let hc = c.header_chain().hash_chain();
            (
                hc.get_timestamp(&parent).unwrap_or(0),
                hc.get_height(&parent).unwrap_or(0),
                c.next_target_after(&parent).unwrap_or(self.params.max_mining_target),
            )
        });

        let coinbase = Transaction::new_coinbase(
            block_reward(parent_height + 1),
            LockupScript::P2pkh(self.keypair.lockup_hash()),
        );
        let mut transactions = user_txs;
        transactions.push(coinbase);

        let mut header = BlockHeader {
            deps: BlockDeps(deps),
            txs_root: Block::compute_txs_root(&transactions),
            timestamp_ms: parent_ts + self.params.expected_time_span_ms,
            target,
            nonce: salt.wrapping_mul(1_000_003),
        };
        self.grind(ci, &mut header);
        Block { header, transactions }
    }

    /// Grind the nonce until the header hash meets its target and derives
    /// to the requested chain. Cheap under the test-friendly max target.
    pub fn grind(&self, ci: ChainIndex, header: &mut BlockHeader) {
        loop {
            let hash = header.hash();
            if crate::pow::hash_meets_target(&hash, header.target)
                && ChainIndex::from_hash(&hash, self.params.groups) == ci
            {
                return;
            }
            header.nonce = header.nonce.wrapping_add(1);
        }
    }

    /// Spend an output locked to the fixture key, paying `amount` to a
    /// p2pkh target; the remainder becomes the fee.
    pub fn signed_transfer(&self, input: AssetOutputRef, amount: u64, to: Hash256) -> Transaction {
        let unsigned = UnsignedTx {
            inputs: vec![input],
            fixed_outputs: vec![TxOutput { amount, lockup: LockupScript::P2pkh(to) }],
            script: None,
        };
        let signature = self.keypair.sign_tx(&unsigned);
        Transaction {
            unsigned,
            signatures: vec![InputSignature {
                pubkey: self.keypair.public_key_bytes().to_vec(),
                signature: signature.to_vec(),
            }],
            generated_outputs: Vec::new(),
        }
    }
}
