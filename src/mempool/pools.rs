//! The two mempool layers of one group share this pool structure: a FIFO
//! of transactions with the index triple and a capacity bound.
//!
//! * The **shared pool** holds everything admissible; on overflow it evicts
//!   its oldest entries to make room.
//! * The **pending pool** holds only txs whose inputs all resolve against
//!   the persisted world state (ready to mine); on overflow `add` returns
//!   false and the caller retries or drops.
//!
//! Admission rejects any tx spending an output already claimed by a
//! different pool tx. Add/remove are idempotent.

use std::collections::{HashMap, VecDeque};

use crate::core::types::*;
use crate::mempool::indexes::TxIndexes;
use crate::state::WorldState;

#[derive(Debug, Clone)]
pub struct PoolTx {
    pub tx: Transaction,
    pub timestamp_ms: u64,
}

/// What to do when `add` finds the pool at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Shared pool: drop oldest entries until the new tx fits
    EvictOldest,
    /// Pending pool: refuse the new tx
    Reject,
}

pub struct Pool {
    entries: HashMap<Hash256, PoolTx>,
    /// Insertion order (oldest at the front); entries removed out-of-band
    /// leave stale slots that eviction and scans skip lazily
    order: VecDeque<Hash256>,
    indexes: TxIndexes,
    capacity: usize,
    overflow: OverflowPolicy,
}

impl Pool {
    pub fn shared(capacity: usize) -> Self {
        Self::new(capacity, OverflowPolicy::EvictOldest)
    }

    pub fn pending(capacity: usize) -> Self {
        Self::new(capacity, OverflowPolicy::Reject)
    }

    fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Pool {
            entries: HashMap::new(),
            order: VecDeque::new(),
            indexes: TxIndexes::new(),
            capacity,
            overflow,
        }
    }

    /// Admit a transaction. Returns false when the tx double-spends
    /// against the pool or the pool is full and may not evict. Re-adding
    /// a present tx is a no-op that reports success.
    pub fn add(&mut self, tx: &Transaction, now_ms: u64) -> bool {
        let tx_hash = tx.hash();
        if self.entries.contains_key(&tx_hash) {
            return true;
        }
        if self.indexes.has_input_conflict(tx) {
            return false;
        }
        if self.entries.len() >= self.capacity {
            match self.overflow {
                OverflowPolicy::Reject => return false,
                OverflowPolicy::EvictOldest => {
                    while self.entries.len() >= self.capacity {
                        if !self.evict_oldest() {
                            return false;
                        }
                    }
                }
            }
        }
        self.indexes.add_tx(tx);
        self.entries.insert(tx_hash, PoolTx { tx: tx.clone(), timestamp_ms: now_ms });
        self.order.push_back(tx_hash);
        true
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some(hash) = self.order.pop_front() {
            if let Some(entry) = self.entries.remove(&hash) {
                self.indexes.remove_tx(&entry.tx);
                return true;
            }
            // Stale slot from an out-of-band removal; keep popping
        }
        false
    }

    pub fn remove(&mut self, tx_hash: &Hash256) -> Option<Transaction> {
        let entry = self.entries.remove(tx_hash)?;
        self.indexes.remove_tx(&entry.tx);
        Some(entry.tx)
    }

    pub fn contains(&self, tx_hash: &Hash256) -> bool {
        self.entries.contains_key(tx_hash)
    }

    pub fn is_double_spending(&self, tx: &Transaction) -> bool {
        self.indexes.has_input_conflict(tx)
    }

    pub fn indexes(&self) -> &TxIndexes {
        &self.indexes
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Entries older than `threshold_ms`, ascending by timestamp
    pub fn take_old_txs(&self, threshold_ms: u64) -> Vec<PoolTx> {
        let mut old: Vec<PoolTx> = self
            .entries
            .values()
            .filter(|e| e.timestamp_ms < threshold_ms)
            .cloned()
            .collect();
        old.sort_by_key(|e| e.timestamp_ms);
        old
    }

    /// Up to `limit` txs whose inputs all resolve in `world_state`, oldest
    /// first. Entries stay in the pool; confirmation removes them later.
    pub fn extract_ready_txs(&self, world_state: &WorldState, limit: usize) -> Vec<Transaction> {
        let mut ready = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for hash in &self.order {
            if ready.len() >= limit {
                break;
            }
            // A remove-then-readd leaves a stale duplicate slot in `order`
            if !seen.insert(*hash) {
                continue;
            }
            if let Some(entry) = self.entries.get(hash) {
                if world_state.contains_all_inputs(&entry.tx) {
                    ready.push(entry.tx.clone());
                }
            }
        }
        ready
    }

    /// Remove and return every tx that became ready (shared -> pending
    /// promotion path)
    pub fn drain_ready_txs(&mut self, world_state: &WorldState) -> Vec<Transaction> {
        let ready_hashes: Vec<Hash256> = self
            .order
            .iter()
            .filter(|h| {
                self.entries
                    .get(*h)
                    .map(|e| world_state.contains_all_inputs(&e.tx))
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        ready_hashes.into_iter().filter_map(|h| self.remove(&h)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(input_byte: u8, owner: u8) -> Transaction {
        Transaction {
            unsigned: UnsignedTx {
                inputs: vec![AssetOutputRef { tx_hash: [input_byte; 32], index: 0 }],
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

    #[test]
    fn test_double_spend_rejected() {
        let mut pool = Pool::shared(10);
        let t1 = tx(1, 9);
        let t2 = tx(1, 8);
        assert!(pool.add(&t1, 100));
        assert!(pool.is_double_spending(&t2));
        assert!(!pool.add(&t2, 101));
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_add_idempotent() {
        let mut pool = Pool::shared(10);
        let t = tx(1, 9);
        assert!(pool.add(&t, 100));
        assert!(pool.add(&t, 200));
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_pending_capacity_rejects_then_accepts_after_remove() {
        let mut pool = Pool::pending(2);
        let t1 = tx(1, 9);
        let t2 = tx(2, 9);
        let t3 = tx(3, 9);
        assert!(pool.add(&t1, 100));
        assert!(pool.add(&t2, 101));
        assert!(pool.is_full());
        assert!(!pool.add(&t3, 102));
        pool.remove(&t1.hash());
        assert!(pool.add(&t3, 103));
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_shared_overflow_evicts_oldest() {
        let mut pool = Pool::shared(2);
        let t1 = tx(1, 9);
        let t2 = tx(2, 9);
        let t3 = tx(3, 9);
        assert!(pool.add(&t1, 100));
        assert!(pool.add(&t2, 101));
        assert!(pool.add(&t3, 102));
        assert_eq!(pool.size(), 2);
        assert!(!pool.contains(&t1.hash()));
        assert!(pool.contains(&t2.hash()));
        assert!(pool.contains(&t3.hash()));
        // The evicted tx's inputs are free again
        assert!(!pool.indexes().is_spent(&t1.unsigned.inputs[0]));
    }

    #[test]
    fn test_take_old_txs_ascending() {
        let mut pool = Pool::pending(10);
        pool.add(&tx(1, 9), 300);
        pool.add(&tx(2, 9), 100);
        pool.add(&tx(3, 9), 200);
        let old = pool.take_old_txs(250);
        assert_eq!(old.len(), 2);
        assert_eq!(old[0].timestamp_ms, 100);
        assert_eq!(old[1].timestamp_ms, 200);
    }

    #[test]
    fn test_readd_after_remove_extracts_once() {
        let mut pool = Pool::pending(10);
        let funded = Transaction::new_coinbase(10, LockupScript::P2pkh([9; 32]));
        let world = WorldState::new().apply(&funded).unwrap();
        let ready = Transaction {
            unsigned: UnsignedTx {
                inputs: vec![AssetOutputRef { tx_hash: funded.hash(), index: 0 }],
                fixed_outputs: vec![TxOutput { amount: 10, lockup: LockupScript::P2pkh([8; 32]) }],
                script: None,
            },
            signatures: Vec::new(),
            generated_outputs: Vec::new(),
        };
        pool.add(&ready, 100);
        pool.remove(&ready.hash());
        pool.add(&ready, 200);
        assert_eq!(pool.extract_ready_txs(&world, 10).len(), 1);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_extract_ready_against_world_state() {
        let mut pool = Pool::pending(10);
        let funded = Transaction::new_coinbase(10, LockupScript::P2pkh([9; 32]));
        let world = WorldState::new().apply(&funded).unwrap();

        let ready = Transaction {
            unsigned: UnsignedTx {
                inputs: vec![AssetOutputRef { tx_hash: funded.hash(), index: 0 }],
                fixed_outputs: vec![TxOutput { amount: 10, lockup: LockupScript::P2pkh([8; 32]) }],
                script: None,
            },
            signatures: Vec::new(),
            generated_outputs: Vec::new(),
        };
        let not_ready = tx(0x44, 9);
        pool.add(&ready, 100);
        pool.add(&not_ready, 101);

        let extracted = pool.extract_ready_txs(&world, 10);
        assert_eq!(extracted, vec![ready.clone()]);
        // Extraction does not remove
        assert!(pool.contains(&ready.hash()));

        let drained = pool.drain_ready_txs(&world);
        assert_eq!(drained, vec![ready.clone()]);
        assert!(!pool.contains(&ready.hash()));
        assert!(pool.contains(&not_ready.hash()));
    }
}
