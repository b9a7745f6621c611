//! BlockFlow: the cross-chain view over the `G × G` chains.
//!
//! Responsibilities:
//!   * route incoming blocks to their chain after verifying every dep is
//!     known and sits on the slot's expected chain,
//!   * assemble the maximum-weight *consistent* dependency vector per
//!     group for mining templates,
//!   * answer sync questions (locators, inventories, intra-clique hashes).
//!
//! Locking: each chain has its own RW lock; flow code locks one chain at a
//! time. Best-deps reads per-chain sequence numbers before and after the
//! computation and retries when a chain moved underneath it.

pub mod block_chain;
pub mod hash_chain;
pub mod header_chain;
pub mod multi_chain;

#[cfg(test)]
pub(crate) mod test_support;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::BrokerConfig;
use crate::core::params::ConsensusParams;
use crate::core::types::*;
use crate::state::CheckpointStore;
use crate::storage::{StorageError, Stores};

use multi_chain::MultiChain;

pub struct BlockFlow {
    multi: MultiChain,
    /// Routing table: every accepted hash to the chain that holds it
    chain_of: RwLock<HashMap<Hash256, ChainIndex>>,
}

impl BlockFlow {
    pub fn new(
        params: ConsensusParams,
        broker: BrokerConfig,
        stores: Arc<Stores>,
    ) -> Result<Self, FlowError> {
        let was_initialized = stores.is_initialized();
        let checkpoints = Arc::new(CheckpointStore::new(stores.clone()));
        let multi = MultiChain::new(params.clone(), broker, stores.clone(), checkpoints)?;

        let mut chain_of = HashMap::new();
        for flat in 0..params.chain_count() {
            let ci = ChainIndex::from_flat_index(flat, params.groups);
            let genesis = multi.read(ci, |c| c.header_chain().hash_chain().genesis_hash());
            chain_of.insert(genesis, ci);
        }

        let flow = BlockFlow { multi, chain_of: RwLock::new(chain_of) };
        if was_initialized {
            flow.reload_persisted(&stores)?;
        } else {
            stores.mark_initialized().map_err(FlowError::from_storage)?;
        }
        Ok(flow)
    }

    /// Replay persisted blocks after a restart. Deps can point across
    /// chains at arbitrary heights, so blocks that still miss a
    /// prerequisite are retried in later passes until a pass stalls.
    fn reload_persisted(&self, stores: &Stores) -> Result<(), FlowError> {
        let mut with_heights: Vec<(u64, Block)> = Vec::new();
        for entry in stores.scan_block_states() {
            let (hash, record) = entry.map_err(FlowError::from_storage)?;
            if record.height == 0 {
                continue;
            }
            if let Some(block) = stores.get_block(&hash).map_err(FlowError::from_storage)? {
                with_heights.push((record.height, block));
            }
        }
        with_heights.sort_by_key(|(height, _)| *height);

        let mut remaining: Vec<Block> = with_heights.into_iter().map(|(_, b)| b).collect();
        loop {
            let before = remaining.len();
            let mut next = Vec::new();
            for block in remaining {
                match self.add_block(&block) {
                    Ok(_) | Err(FlowError::DuplicateBlock) => {}
                    Err(FlowError::MissingBlock(_)) => next.push(block),
                    Err(e) => return Err(e),
                }
            }
            remaining = next;
            if remaining.is_empty() || remaining.len() == before {
                break;
            }
        }
        if !remaining.is_empty() {
            tracing::warn!("⚠️  {} persisted blocks failed to replay", remaining.len());
        }
        tracing::info!("💾 Reloaded chain state: {} blocks", self.num_hashes());
        Ok(())
    }

    pub fn params(&self) -> &ConsensusParams {
        self.multi.params()
    }

    pub fn broker(&self) -> &BrokerConfig {
        self.multi.broker()
    }

    pub fn multi_chain(&self) -> &MultiChain {
        &self.multi
    }

    pub fn num_hashes(&self) -> usize {
        self.multi.num_hashes()
    }

    // ─── Lookups ────────────────────────────────────────────────────

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.chain_of.read().unwrap().contains_key(hash)
    }

    pub fn chain_index_of(&self, hash: &Hash256) -> Option<ChainIndex> {
        self.chain_of.read().unwrap().get(hash).copied()
    }

    pub fn genesis_hash(&self, chain_index: ChainIndex) -> Hash256 {
        self.multi.read(chain_index, |c| c.header_chain().hash_chain().genesis_hash())
    }

    pub fn best_tip(&self, chain_index: ChainIndex) -> Hash256 {
        self.multi.read(chain_index, |c| c.best_tip())
    }

    pub fn get_block(&self, hash: &Hash256) -> Option<Block> {
        let ci = self.chain_index_of(hash)?;
        self.multi.read(ci, |c| c.get_block(hash).cloned())
    }

    fn get_header(&self, hash: &Hash256) -> Option<BlockHeader> {
        let ci = self.chain_index_of(hash)?;
        self.multi.read(ci, |c| c.header_chain().get_header(hash).cloned())
    }

    // ─── Block Ingestion ────────────────────────────────────────────

    /// Verify the dep vector (every dep known, every slot on its formula
    /// chain), then hand the block to its chain's writer.
    pub fn add_block(&self, block: &Block) -> Result<Hash256, FlowError> {
        let groups = self.params().groups;
        let ci = block.header.chain_index(groups);
        let deps = &block.header.deps;
        if deps.len() != self.params().dep_count() {
            return Err(FlowError::InvalidDeps);
        }
        {
            let map = self.chain_of.read().unwrap();
            for (slot, dep) in deps.0.iter().enumerate() {
                let expected = BlockDeps::slot_chain(ci, slot, groups);
                match map.get(dep) {
                    None => return Err(FlowError::MissingBlock(*dep)),
                    Some(actual) if *actual != expected => return Err(FlowError::InvalidDeps),
                    Some(_) => {}
                }
            }
        }
        let hash = self.multi.write(ci, |c| c.add(block))?;
        self.chain_of.write().unwrap().insert(hash, ci);
        Ok(hash)
    }

    // ─── Best View ──────────────────────────────────────────────────

    /// The chains a group-`g` dep vector selects from, in canonical order:
    /// intra-group chains `(h, h)` for `h != g` ascending, then the whole
    /// row `(g, t)` ascending. `2G − 1` chains total.
    pub fn involved_chains(&self, group: GroupIndex) -> Vec<ChainIndex> {
        let groups = self.params().groups;
        let mut chains = Vec::with_capacity(self.params().dep_count());
        for h in 0..groups {
            if h != group {
                chains.push(ChainIndex::new(h, h));
            }
        }
        for t in 0..groups {
            chains.push(ChainIndex::new(group, t));
        }
        chains
    }

    /// Best consistent dep vector for a group, in `involved_chains` order.
    /// Deterministic: the same tip sets produce the same vector on any
    /// node. Retries when a chain advances mid-computation.
    pub fn get_best_deps(&self, group: GroupIndex) -> Result<Vec<Hash256>, FlowError> {
        loop {
            let before = self.sequence_snapshot(group);
            let deps = self.compute_best_deps(group)?;
            if self.sequence_snapshot(group) == before {
                return Ok(deps);
            }
        }
    }

    fn sequence_snapshot(&self, group: GroupIndex) -> Vec<u64> {
        self.involved_chains(group)
            .into_iter()
            .map(|ci| self.multi.read(ci, |c| c.sequence()))
            .collect()
    }

    fn compute_best_deps(&self, group: GroupIndex) -> Result<Vec<Hash256>, FlowError> {
        let chains = self.involved_chains(group);
        // Per-chain candidate lists: tips heaviest-first, extended with
        // ancestors on demand when every tip conflicts
        let mut candidates: Vec<Vec<Hash256>> = chains
            .iter()
            .map(|ci| self.multi.read(*ci, |c| c.header_chain().hash_chain().tips_sorted()))
            .collect();
        let mut cursor = vec![0usize; chains.len()];

        loop {
            match self.first_conflict(&chains, &candidates, &cursor) {
                None => {
                    return Ok((0..chains.len()).map(|k| candidates[k][cursor[k]]).collect());
                }
                Some((i, j)) => {
                    let (wi, hi) = self.candidate_weight(chains[i], candidates[i][cursor[i]]);
                    let (wj, hj) = self.candidate_weight(chains[j], candidates[j][cursor[j]]);
                    // Demote the lighter member; ties demote the larger hash
                    let k = if wi < wj || (wi == wj && hi > hj) { i } else { j };
                    let other = if k == i { j } else { i };
                    if !self.demote(&chains, &mut candidates, &mut cursor, k) {
                        // k is pinned at genesis; the conflict must resolve
                        // from the other side
                        self.demote(&chains, &mut candidates, &mut cursor, other);
                    }
                }
            }
        }
    }

    fn candidate_weight(&self, ci: ChainIndex, hash: Hash256) -> (u128, Hash256) {
        let weight = self
            .multi
            .read(ci, |c| c.header_chain().hash_chain().get_weight(&hash))
            .unwrap_or(0);
        (weight, hash)
    }

    /// Move chain `k` to its next candidate, growing the list with the
    /// current candidate's parent when the tips are exhausted. Returns
    /// false when already at genesis.
    fn demote(
        &self,
        chains: &[ChainIndex],
        candidates: &mut [Vec<Hash256>],
        cursor: &mut [usize],
        k: usize,
    ) -> bool {
        if cursor[k] + 1 == candidates[k].len() {
            let last = candidates[k][cursor[k]];
            let pred = self.multi.read(chains[k], |c| {
                let hc = c.header_chain().hash_chain();
                let height = hc.get_height(&last)?;
                height.checked_sub(1).and_then(|h| hc.get_predecessor(&last, h))
            });
            match pred {
                Some(p) => candidates[k].push(p),
                None => return false,
            }
        }
        cursor[k] += 1;
        true
    }

    fn first_conflict(
        &self,
        chains: &[ChainIndex],
        candidates: &[Vec<Hash256>],
        cursor: &[usize],
    ) -> Option<(usize, usize)> {
        for i in 0..chains.len() {
            for j in (i + 1)..chains.len() {
                let x = candidates[i][cursor[i]];
                let y = candidates[j][cursor[j]];
                if !self.compatible(chains[i], x, chains[j], y)
                    || !self.compatible(chains[j], y, chains[i], x)
                {
                    return Some((i, j));
                }
            }
        }
        None
    }

    /// One direction of the consistency check: X's flow-projected view of
    /// Y's chain must be an ancestor of (or equal to) Y. A projection of
    /// `None` (genesis closure) is vacuously compatible.
    fn compatible(&self, cx: ChainIndex, x: Hash256, cy: ChainIndex, y: Hash256) -> bool {
        match self.flow_tip_of(cx, &x, cy) {
            None => true,
            Some(view) => self
                .multi
                .read(cy, |c| c.header_chain().hash_chain().is_ancestor_or_equal(&view, &y)),
        }
    }

    /// Project a block's recorded closure onto `target`: the block itself
    /// when already there; its dep slot when `target` shares the block's
    /// `from` group; otherwise two hops through the in-dep of `target.from`.
    fn flow_tip_of(&self, ci: ChainIndex, hash: &Hash256, target: ChainIndex) -> Option<Hash256> {
        if ci == target {
            return Some(*hash);
        }
        let groups = self.params().groups;
        let header = self.get_header(hash)?;
        if header.deps.is_empty() {
            return None;
        }
        if ci.from == target.from {
            return header.deps.dep_for_chain(ci, target, groups);
        }
        let intra = ChainIndex::new(target.from, target.from);
        let hop = header.deps.dep_for_chain(ci, intra, groups)?;
        if target == intra {
            return Some(hop);
        }
        let hop_header = self.get_header(&hop)?;
        if hop_header.deps.is_empty() {
            return None;
        }
        hop_header.deps.dep_for_chain(intra, target, groups)
    }

    /// Dep vector for a template on `chain_index`, in header-slot order
    /// (incoming, outgoing, direct parent).
    pub fn template_deps(&self, chain_index: ChainIndex) -> Result<BlockDeps, FlowError> {
        let best = self.get_best_deps(chain_index.from)?;
        let chains = self.involved_chains(chain_index.from);
        let by_chain: HashMap<ChainIndex, Hash256> =
            chains.into_iter().zip(best.into_iter()).collect();
        let groups = self.params().groups;
        let deps = (0..self.params().dep_count())
            .map(|slot| by_chain[&BlockDeps::slot_chain(chain_index, slot, groups)])
            .collect();
        Ok(BlockDeps(deps))
    }

    // ─── Sync ───────────────────────────────────────────────────────

    /// For each owned chain: tip ancestors at exponentially spaced
    /// heights, newest first, genesis always included.
    pub fn get_sync_locators(&self) -> Vec<Vec<Hash256>> {
        const MAX_LOCATOR: usize = 32;
        self.multi
            .owned_chains()
            .into_iter()
            .map(|ci| {
                self.multi.read(ci, |c| {
                    let hc = c.header_chain().hash_chain();
                    let tip = hc.best_tip();
                    let mut locator = Vec::new();
                    let mut h = hc.get_height(&tip).unwrap_or(0);
                    let mut step: u64 = 1;
                    while locator.len() < MAX_LOCATOR {
                        if let Some(hash) = hc.get_predecessor(&tip, h) {
                            locator.push(hash);
                        }
                        if h == 0 {
                            break;
                        }
                        h = h.saturating_sub(step);
                        // After a few entries, back off faster
                        if locator.len() > 8 {
                            step = (step * 2).min(1024);
                        }
                    }
                    let genesis = hc.genesis_hash();
                    if locator.last().copied() != Some(genesis) {
                        locator.push(genesis);
                    }
                    locator
                })
            })
            .collect()
    }

    /// Answer a remote's locators: for each owned chain, every hash past
    /// the first locator entry we recognize (capped at `limit` per chain).
    pub fn get_sync_inventories(
        &self,
        remote_locators: &[Vec<Hash256>],
        limit: usize,
    ) -> Vec<Vec<Hash256>> {
        self.multi
            .owned_chains()
            .into_iter()
            .enumerate()
            .map(|(i, ci)| {
                self.multi.read(ci, |c| {
                    let hc = c.header_chain().hash_chain();
                    let anchor = remote_locators
                        .get(i)
                        .and_then(|locator| locator.iter().find(|h| hc.contains(h)).copied())
                        .unwrap_or_else(|| hc.genesis_hash());
                    let mut hashes = hc.get_hashes_after(&anchor);
                    hashes.truncate(limit);
                    hashes
                })
            })
            .collect()
    }

    /// Everything we hold on chains the remote broker also owns
    pub fn get_intra_clique_sync_hashes(&self, remote: &BrokerConfig) -> Vec<Vec<Hash256>> {
        self.multi
            .owned_chains()
            .into_iter()
            .filter(|ci| remote.owns_chain(*ci))
            .map(|ci| self.multi.read(ci, |c| c.header_chain().hash_chain().all_hashes()))
            .collect()
    }
}

// ─── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum FlowError {
    MissingParent,
    /// A prerequisite block is not known yet; callers queue a download
    MissingBlock(Hash256),
    DuplicateBlock,
    InvalidChainIndex,
    InvalidDeps,
    InvalidTarget { expected: u32, got: u32 },
    InvalidTimestamp,
    InvalidTxsRoot,
    InvalidPow,
    InvalidCoinbase,
    InvalidExecution(String),
    Io(String),
}

impl FlowError {
    pub fn from_storage(e: StorageError) -> Self {
        FlowError::Io(e.to_string())
    }

    /// Validation failures penalize the peer that supplied the data;
    /// missing blocks and IO problems do not.
    pub fn is_validation(&self) -> bool {
        !matches!(self, FlowError::MissingBlock(_) | FlowError::Io(_) | FlowError::DuplicateBlock)
    }
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowError::MissingParent => write!(f, "missing parent"),
            FlowError::MissingBlock(h) => write!(f, "missing block {}", hex::encode(h)),
            FlowError::DuplicateBlock => write!(f, "duplicate block"),
            FlowError::InvalidChainIndex => write!(f, "block hash lands on the wrong chain"),
            FlowError::InvalidDeps => write!(f, "invalid dep vector"),
            FlowError::InvalidTarget { expected, got } => {
                write!(f, "target mismatch ({:#010x} vs {:#010x})", expected, got)
            }
            FlowError::InvalidTimestamp => write!(f, "timestamp not after parent"),
            FlowError::InvalidTxsRoot => write!(f, "invalid txs root"),
            FlowError::InvalidPow => write!(f, "insufficient proof of work"),
            FlowError::InvalidCoinbase => write!(f, "invalid coinbase"),
            FlowError::InvalidExecution(msg) => write!(f, "invalid execution: {}", msg),
            FlowError::Io(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl std::error::Error for FlowError {}
