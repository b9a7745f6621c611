//! Index triple over the transactions of one pool: who spends which
//! output, which unspent outputs the pool itself produces, and which
//! output refs belong to which lockup script.
//!
//! Add and remove are idempotent — re-adding a present tx and removing an
//! absent one are no-ops — so pool layers can reconcile without bookending
//! every call with a membership check.

use std::collections::{HashMap, HashSet};

use crate::core::types::*;

#[derive(Debug, Default)]
pub struct TxIndexes {
    /// Which pool tx spends a given output
    input_index: HashMap<AssetOutputRef, Hash256>,
    /// Unspent outputs produced by pool txs
    output_index: HashMap<AssetOutputRef, TxOutput>,
    /// Output refs per lockup script (wallet UTXO queries)
    address_index: HashMap<LockupScript, HashSet<AssetOutputRef>>,
    /// Membership for idempotency
    seen: HashSet<Hash256>,
}

/// Outcome of a UTXO lookup against the pool indexes
#[derive(Debug, PartialEq, Eq)]
pub enum UtxoStatus {
    Spent,
    Unspent(TxOutput),
    Unknown,
}

impl TxIndexes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, tx_hash: &Hash256) -> bool {
        self.seen.contains(tx_hash)
    }

    pub fn is_spent(&self, output_ref: &AssetOutputRef) -> bool {
        self.input_index.contains_key(output_ref)
    }

    pub fn spender_of(&self, output_ref: &AssetOutputRef) -> Option<&Hash256> {
        self.input_index.get(output_ref)
    }

    /// Spent beats unspent: an output consumed by a pool tx reports
    /// `Spent` even though it also appears in the output index.
    pub fn get_utxo(&self, output_ref: &AssetOutputRef) -> UtxoStatus {
        if self.input_index.contains_key(output_ref) {
            return UtxoStatus::Spent;
        }
        match self.output_index.get(output_ref) {
            Some(output) => UtxoStatus::Unspent(output.clone()),
            None => UtxoStatus::Unknown,
        }
    }

    /// Pool-produced outputs locked to the given script
    pub fn get_relevant_utxos(&self, lockup: &LockupScript) -> Vec<(AssetOutputRef, TxOutput)> {
        let Some(refs) = self.address_index.get(lockup) else {
            return Vec::new();
        };
        let mut utxos: Vec<(AssetOutputRef, TxOutput)> = refs
            .iter()
            .filter_map(|r| self.output_index.get(r).map(|o| (*r, o.clone())))
            .collect();
        utxos.sort_by_key(|(r, _)| *r);
        utxos
    }

    /// Does any of the tx's inputs collide with an input already indexed
    /// for a *different* tx?
    pub fn has_input_conflict(&self, tx: &Transaction) -> bool {
        let tx_hash = tx.hash();
        tx.unsigned
            .inputs
            .iter()
            .any(|r| self.input_index.get(r).map(|spender| *spender != tx_hash).unwrap_or(false))
    }

    pub fn add_tx(&mut self, tx: &Transaction) {
        let tx_hash = tx.hash();
        if !self.seen.insert(tx_hash) {
            return;
        }
        for input in &tx.unsigned.inputs {
            self.input_index.insert(*input, tx_hash);
        }
        for (index, output) in tx.all_outputs() {
            let output_ref = AssetOutputRef { tx_hash, index };
            self.output_index.insert(output_ref, output.clone());
            self.address_index.entry(output.lockup.clone()).or_default().insert(output_ref);
        }
    }

    pub fn remove_tx(&mut self, tx: &Transaction) {
        let tx_hash = tx.hash();
        if !self.seen.remove(&tx_hash) {
            return;
        }
        for input in &tx.unsigned.inputs {
            self.input_index.remove(input);
        }
        for (index, output) in tx.all_outputs() {
            let output_ref = AssetOutputRef { tx_hash, index };
            self.output_index.remove(&output_ref);
            if let Some(refs) = self.address_index.get_mut(&output.lockup) {
                refs.remove(&output_ref);
                if refs.is_empty() {
                    self.address_index.remove(&output.lockup);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
