//! World state: the set of unspent outputs visible to one chain, versioned
//! by a root hash. Applying a transaction is functional — it returns a new
//! state — so concurrent readers pinned at different roots need no locking.
//!
//! The checkpoint store maps root hashes to snapshots. Snapshots are
//! immutable once committed, giving MVCC-by-root over the sled `trie` tree.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::types::*;
use crate::storage::{StorageError, Stores};

/// The aggregate of all unspent outputs at some block, addressable by its
/// root hash.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct WorldState {
    utxos: HashMap<AssetOutputRef, TxOutput>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root hash: blake3 over the sorted entry set. Deterministic for a
    /// given UTXO set regardless of insertion order.
    pub fn root(&self) -> Hash256 {
        let mut refs: Vec<&AssetOutputRef> = self.utxos.keys().collect();
        refs.sort();
        let mut hasher = blake3::Hasher::new();
        for r in refs {
            hasher.update(&r.tx_hash);
            hasher.update(&r.index.to_le_bytes());
            let output = &self.utxos[r];
            hasher.update(&output.amount.to_le_bytes());
            hasher.update(output.lockup.p2pkh_hash());
        }
        *hasher.finalize().as_bytes()
    }

    pub fn get(&self, output_ref: &AssetOutputRef) -> Option<&TxOutput> {
        self.utxos.get(output_ref)
    }

    pub fn contains(&self, output_ref: &AssetOutputRef) -> bool {
        self.utxos.contains_key(output_ref)
    }

    /// Are all of the tx's inputs spendable in this state?
    pub fn contains_all_inputs(&self, tx: &Transaction) -> bool {
        tx.unsigned.inputs.iter().all(|r| self.utxos.contains_key(r))
    }

    /// Apply one transaction: consume its inputs, create its outputs.
    /// Returns the successor state; the receiver is untouched.
    pub fn apply(&self, tx: &Transaction) -> Result<WorldState, StateError> {
        let mut next = self.clone();
        let tx_hash = tx.hash();
        for input in &tx.unsigned.inputs {
            if next.utxos.remove(input).is_none() {
                return Err(StateError::MissingInput(*input));
            }
        }
        for (index, output) in tx.all_outputs() {
            next.utxos.insert(AssetOutputRef { tx_hash, index }, output.clone());
        }
        Ok(next)
    }

    /// Outputs locked to the given script (wallet UTXO queries)
    pub fn outputs_for(&self, lockup: &LockupScript) -> Vec<(AssetOutputRef, TxOutput)> {
        self.utxos
            .iter()
            .filter(|(_, o)| &o.lockup == lockup)
            .map(|(r, o)| (*r, o.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }
}

// ─── Checkpoint Store ───────────────────────────────────────────────

/// Root-addressed world-state snapshots. Hot snapshots stay in an
/// in-memory map; every commit also lands in the sled trie tree so a
/// restarted node can rehydrate any referenced root.
pub struct CheckpointStore {
    stores: Arc<Stores>,
    cache: std::sync::RwLock<HashMap<Hash256, WorldState>>,
}

impl CheckpointStore {
    pub fn new(stores: Arc<Stores>) -> Self {
        Self { stores, cache: std::sync::RwLock::new(HashMap::new()) }
    }

    /// Persist a snapshot under its root hash and return the root.
    pub fn commit(&self, state: &WorldState) -> Result<Hash256, StorageError> {
        let root = state.root();
        let bytes = bincode::serialize(state)
            .map_err(|e| StorageError::SerializeError(e.to_string()))?;
        self.stores.put_trie_snapshot(&root, &bytes)?;
        self.cache.write().unwrap().insert(root, state.clone());
        Ok(root)
    }

    pub fn get(&self, root: &Hash256) -> Result<Option<WorldState>, StorageError> {
        if let Some(state) = self.cache.read().unwrap().get(root) {
            return Ok(Some(state.clone()));
        }
        match self.stores.get_trie_snapshot(root)? {
            Some(bytes) => {
                let state: WorldState = bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::SerializeError(e.to_string()))?;
                self.cache.write().unwrap().insert(*root, state.clone());
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}

// ─── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub enum StateError {
    MissingInput(AssetOutputRef),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::MissingInput(r) => {
                write!(f, "missing input {}:{}", hex::encode(r.tx_hash), r.index)
            }
        }
    }
}

impl std::error::Error for StateError {}
