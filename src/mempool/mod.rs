//! Per-group mempool: a facade over the shared and pending layers.
//!
//! Incoming txs route by readiness — inputs all present in the persisted
//! world state go straight to pending (mineable), everything else waits in
//! shared. A periodic `clean` promotes newly ready txs, expires stale
//! pending entries, and drops txs whose inputs have since been consumed.
//!
//! Both layers sit behind their own RW lock. No method holds two write
//! locks at once, and no pool method is called while already holding that
//! pool's write lock.

pub mod indexes;
pub mod pools;

use std::sync::RwLock;

use crate::config::MempoolConfig;
use crate::core::types::*;
use crate::mempool::pools::Pool;
use crate::state::WorldState;

pub struct MemPool {
    group: GroupIndex,
    config: MempoolConfig,
    shared: RwLock<Pool>,
    pending: RwLock<Pool>,
}

impl MemPool {
    pub fn new(group: GroupIndex, config: MempoolConfig) -> Self {
        MemPool {
            group,
            shared: RwLock::new(Pool::shared(config.shared_pool_capacity)),
            pending: RwLock::new(Pool::pending(config.pending_pool_capacity)),
            config,
        }
    }

    pub fn group(&self) -> GroupIndex {
        self.group
    }

    /// Admit a transaction, routing ready txs to the pending layer.
    /// Returns false for double-spends and full pools.
    pub fn add(&self, tx: &Transaction, now_ms: u64, world_state: &WorldState) -> bool {
        if self.is_double_spending(tx) {
            return false;
        }
        if world_state.contains_all_inputs(tx) {
            self.pending.write().unwrap().add(tx, now_ms)
        } else {
            self.shared.write().unwrap().add(tx, now_ms)
        }
    }

    /// Cheap gossip filter: does any input collide with either layer?
    pub fn is_double_spending(&self, tx: &Transaction) -> bool {
        self.shared.read().unwrap().is_double_spending(tx)
            || self.pending.read().unwrap().is_double_spending(tx)
    }

    pub fn contains(&self, tx_hash: &Hash256) -> bool {
        self.shared.read().unwrap().contains(tx_hash)
            || self.pending.read().unwrap().contains(tx_hash)
    }

    pub fn size(&self) -> usize {
        self.shared.read().unwrap().size() + self.pending.read().unwrap().size()
    }

    /// Ready txs for a mining template, oldest first
    pub fn extract_ready_txs(&self, world_state: &WorldState, limit: usize) -> Vec<Transaction> {
        self.pending.read().unwrap().extract_ready_txs(world_state, limit)
    }

    /// Pool-held UTXOs for a lockup script (wallet queries)
    pub fn get_relevant_utxos(&self, lockup: &LockupScript) -> Vec<(AssetOutputRef, TxOutput)> {
        let mut utxos = self.shared.read().unwrap().indexes().get_relevant_utxos(lockup);
        utxos.extend(self.pending.read().unwrap().indexes().get_relevant_utxos(lockup));
        utxos
    }

    /// Drop txs confirmed by a new block, plus any pool tx now conflicting
    /// with an input the block consumed.
    pub fn remove_confirmed(&self, block: &Block) {
        let confirmed: Vec<Hash256> = block.non_coinbase().iter().map(|tx| tx.hash()).collect();
        let spent: Vec<AssetOutputRef> = block
            .non_coinbase()
            .iter()
            .flat_map(|tx| tx.unsigned.inputs.iter().copied())
            .collect();

        for pool in [&self.shared, &self.pending] {
            let mut guard = pool.write().unwrap();
            for hash in &confirmed {
                guard.remove(hash);
            }
            let conflicting: Vec<Hash256> = spent
                .iter()
                .filter_map(|r| guard.indexes().spender_of(r).copied())
                .collect();
            for hash in conflicting {
                guard.remove(&hash);
            }
        }
    }

    /// Periodic maintenance:
    ///   1. promote shared txs that became ready,
    ///   2. expire pending txs past the clean frequency,
    ///   3. drop pending txs whose inputs are no longer spendable.
    pub fn clean(&self, now_ms: u64, world_state: &WorldState) {
        // 1: drain ready txs out of shared, then admit them to pending.
        // A full pending layer sends the overflow back to shared.
        let promoted = self.shared.write().unwrap().drain_ready_txs(world_state);
        let mut returned = Vec::new();
        {
            let mut pending = self.pending.write().unwrap();
            for tx in promoted {
                if !pending.add(&tx, now_ms) {
                    returned.push(tx);
                }
            }
        }
        if !returned.is_empty() {
            let mut shared = self.shared.write().unwrap();
            for tx in &returned {
                shared.add(tx, now_ms);
            }
        }

        // 2 + 3: expire and re-validate the pending layer
        let threshold = now_ms.saturating_sub(self.config.clean_frequency_ms);
        let mut pending = self.pending.write().unwrap();
        let stale: Vec<Hash256> =
            pending.take_old_txs(threshold).into_iter().map(|e| e.tx.hash()).collect();
        for hash in stale {
            pending.remove(&hash);
        }
        let remaining: Vec<Transaction> =
            pending.take_old_txs(u64::MAX).into_iter().map(|e| e.tx).collect();
        for tx in remaining {
            if !world_state.contains_all_inputs(&tx) {
                pending.remove(&tx.hash());
            }
        }

        tracing::debug!(
            "🧹 Mempool group {} cleaned: shared={} pending={}",
            self.group,
            self.shared.read().unwrap().size(),
            pending.size(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MempoolConfig {
        MempoolConfig {
            shared_pool_capacity: 4,
            pending_pool_capacity: 4,
            tx_max_number_per_block: 10,
            clean_frequency_ms: 1_000,
        }
    }

    fn transfer(input: AssetOutputRef, owner: u8) -> Transaction {
        Transaction {
            unsigned: UnsignedTx {
                inputs: vec![input],
                fixed_outputs: vec![TxOutput {
                    amount: 10,
                    lockup: LockupScript::P2pkh([owner; 32]),
                }],
                script: None,
            },
            signatures: Vec::new(),
            generated_outputs: Vec::new(),
        }
    }

    fn funded_world(owner: u8) -> (WorldState, AssetOutputRef) {
        let coinbase = Transaction::new_coinbase(10, LockupScript::P2pkh([owner; 32]));
        let world = WorldState::new().apply(&coinbase).unwrap();
        (world, AssetOutputRef { tx_hash: coinbase.hash(), index: 0 })
    }

    #[test]
    fn test_double_spend_across_layers() {
        let mp = MemPool::new(0, config());
        let (world, funded_ref) = funded_world(9);

        let tx1 = transfer(funded_ref, 1);
        assert!(mp.add(&tx1, 100, &world));
        // tx1 was ready, so it sits in pending; a conflicting tx2 is
        // rejected no matter which layer it would land in
        let tx2 = transfer(funded_ref, 2);
        assert!(mp.is_double_spending(&tx2));
        assert!(!mp.add(&tx2, 101, &world));
        assert_eq!(mp.size(), 1);
    }

    #[test]
    fn test_routing_by_readiness() {
        let mp = MemPool::new(0, config());
        let (world, funded_ref) = funded_world(9);

        let ready = transfer(funded_ref, 1);
        let waiting = transfer(AssetOutputRef { tx_hash: [0x66; 32], index: 0 }, 1);
        assert!(mp.add(&ready, 100, &world));
        assert!(mp.add(&waiting, 100, &world));

        assert_eq!(mp.extract_ready_txs(&world, 10), vec![ready]);
        assert_eq!(mp.size(), 2);
    }

    #[test]
    fn test_clean_promotes_newly_ready() {
        let mp = MemPool::new(0, config());
        let (world, funded_ref) = funded_world(9);

        // Not ready against an empty world: lands in shared
        let tx = transfer(funded_ref, 1);
        assert!(mp.add(&tx, 100, &WorldState::new()));
        assert!(mp.extract_ready_txs(&world, 10).is_empty());

        // After the funding block lands, clean moves it to pending
        mp.clean(200, &world);
        assert_eq!(mp.extract_ready_txs(&world, 10), vec![tx]);
    }

    #[test]
    fn test_clean_expires_old_pending() {
        let mp = MemPool::new(0, config());
        let (world, funded_ref) = funded_world(9);
        let tx = transfer(funded_ref, 1);
        assert!(mp.add(&tx, 100, &world));

        // Within the window: kept
        mp.clean(500, &world);
        assert!(mp.contains(&tx.hash()));
        // Past clean_frequency: dropped
        mp.clean(2_000, &world);
        assert!(!mp.contains(&tx.hash()));
    }

    #[test]
    fn test_remove_confirmed_drops_included_and_conflicting() {
        let mp = MemPool::new(0, config());
        let (world, funded_ref) = funded_world(9);

        let included = transfer(funded_ref, 1);
        let (world2, other_ref) = {
            let coinbase = Transaction::new_coinbase(20, LockupScript::P2pkh([8; 32]));
            (world.apply(&coinbase).unwrap(), AssetOutputRef { tx_hash: coinbase.hash(), index: 0 })
        };
        let unrelated = transfer(other_ref, 2);
        assert!(mp.add(&included, 100, &world2));
        assert!(mp.add(&unrelated, 100, &world2));

        let block = Block {
            header: BlockHeader {
                deps: BlockDeps::empty(),
                txs_root: NULL_HASH,
                timestamp_ms: 0,
                target: 0,
                nonce: 0,
            },
            transactions: vec![
                included.clone(),
                Transaction::new_coinbase(1, LockupScript::P2pkh([0; 32])),
            ],
        };
        mp.remove_confirmed(&block);
        assert!(!mp.contains(&included.hash()));
        assert!(mp.contains(&unrelated.hash()));
    }
}
