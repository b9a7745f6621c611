//! Per-chain hash index: an arena of tree nodes tracking height, cumulative
//! weight, the tip set, and a per-height roster.
//!
//! Nodes are append-only — once a hash is in the tree it is never removed.
//! Pruning only shrinks the *tip set*, so `NodeId` indices into the arena
//! stay stable for the lifetime of the chain.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::core::types::Hash256;
use crate::flow::FlowError;
use crate::pow::target_to_work;

pub type NodeId = u32;

#[derive(Debug)]
pub struct TreeNode {
    pub hash: Hash256,
    pub height: u64,
    pub weight: u128,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub timestamp_ms: u64,
    pub target: u32,
}

pub struct HashChain {
    nodes: Vec<TreeNode>,
    index: HashMap<Hash256, NodeId>,
    tips: HashSet<Hash256>,
    /// Per-height roster of every hash ever accepted at that height
    heights: HashMap<u64, Vec<Hash256>>,
    /// (height asc, hash asc) ordering for range scans
    ordered: BTreeSet<(u64, Hash256)>,
    pruned_height: u64,
    tips_prune_interval: u64,
    genesis: Hash256,
}

impl HashChain {
    pub fn new(
        genesis_hash: Hash256,
        timestamp_ms: u64,
        target: u32,
        tips_prune_interval: u64,
    ) -> Self {
        let node = TreeNode {
            hash: genesis_hash,
            height: 0,
            weight: target_to_work(target),
            parent: None,
            children: Vec::new(),
            timestamp_ms,
            target,
        };
        let mut index = HashMap::new();
        index.insert(genesis_hash, 0);
        let mut tips = HashSet::new();
        tips.insert(genesis_hash);
        let mut heights = HashMap::new();
        heights.insert(0, vec![genesis_hash]);
        let mut ordered = BTreeSet::new();
        ordered.insert((0, genesis_hash));
        HashChain {
            nodes: vec![node],
            index,
            tips,
            heights,
            ordered,
            pruned_height: 0,
            tips_prune_interval,
            genesis: genesis_hash,
        }
    }

    // ─── Mutation ───────────────────────────────────────────────────

    /// Wire a new node under its parent. Height and weight derive from the
    /// parent; the parent leaves the tip set and the new node joins it.
    pub fn add(
        &mut self,
        hash: Hash256,
        parent_hash: Hash256,
        timestamp_ms: u64,
        target: u32,
    ) -> Result<NodeId, FlowError> {
        if self.index.contains_key(&hash) {
            return Err(FlowError::DuplicateBlock);
        }
        let parent_id = *self.index.get(&parent_hash).ok_or(FlowError::MissingParent)?;
        let (height, weight) = {
            let parent = &self.nodes[parent_id as usize];
            (parent.height + 1, parent.weight + target_to_work(target))
        };

        let id = self.nodes.len() as NodeId;
        self.nodes.push(TreeNode {
            hash,
            height,
            weight,
            parent: Some(parent_id),
            children: Vec::new(),
            timestamp_ms,
            target,
        });
        self.nodes[parent_id as usize].children.push(id);
        self.index.insert(hash, id);
        self.tips.remove(&parent_hash);
        self.tips.insert(hash);
        self.heights.entry(height).or_default().push(hash);
        self.ordered.insert((height, hash));
        self.maybe_prune_tips();
        Ok(id)
    }

    /// Bound the tip-set size: once the best tip has advanced a full prune
    /// interval, tips trailing more than one interval behind it are dropped
    /// from the set. Their nodes stay in the arena.
    fn maybe_prune_tips(&mut self) {
        let best_height = self.node(&self.best_tip()).unwrap().height;
        if best_height <= self.pruned_height + self.tips_prune_interval {
            return;
        }
        let cutoff = best_height.saturating_sub(self.tips_prune_interval);
        let best = self.best_tip();
        let stale: Vec<Hash256> = self
            .tips
            .iter()
            .filter(|h| **h != best && self.node(h).map(|n| n.height < cutoff).unwrap_or(false))
            .copied()
            .collect();
        for hash in stale {
            self.tips.remove(&hash);
        }
        self.pruned_height = best_height;
    }

    // ─── Lookups ────────────────────────────────────────────────────

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.index.contains_key(hash)
    }

    pub fn node(&self, hash: &Hash256) -> Option<&TreeNode> {
        self.index.get(hash).map(|id| &self.nodes[*id as usize])
    }

    pub fn get_height(&self, hash: &Hash256) -> Option<u64> {
        self.node(hash).map(|n| n.height)
    }

    pub fn get_weight(&self, hash: &Hash256) -> Option<u128> {
        self.node(hash).map(|n| n.weight)
    }

    pub fn get_timestamp(&self, hash: &Hash256) -> Option<u64> {
        self.node(hash).map(|n| n.timestamp_ms)
    }

    pub fn get_target(&self, hash: &Hash256) -> Option<u32> {
        self.node(hash).map(|n| n.target)
    }

    pub fn is_tip(&self, hash: &Hash256) -> bool {
        self.tips.contains(hash)
    }

    pub fn num_hashes(&self) -> usize {
        self.nodes.len()
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis
    }

    pub fn max_height(&self) -> u64 {
        self.node(&self.best_tip()).map(|n| n.height).unwrap_or(0)
    }

    /// The tip with maximum weight; ties break toward the smaller hash so
    /// every node resolves the same best tip from the same tip set.
    pub fn best_tip(&self) -> Hash256 {
        let mut best: Option<(&u128, &Hash256)> = None;
        for hash in &self.tips {
            let weight = &self.node(hash).unwrap().weight;
            best = match best {
                None => Some((weight, hash)),
                Some((bw, bh)) => {
                    if weight > bw || (weight == bw && hash < bh) {
                        Some((weight, hash))
                    } else {
                        Some((bw, bh))
                    }
                }
            };
        }
        *best.expect("chain always has at least the genesis tip").1
    }

    /// All tips, heaviest first, ties toward the smaller hash
    pub fn tips_sorted(&self) -> Vec<Hash256> {
        let mut tips: Vec<Hash256> = self.tips.iter().copied().collect();
        tips.sort_by(|a, b| {
            let wa = self.node(a).unwrap().weight;
            let wb = self.node(b).unwrap().weight;
            wb.cmp(&wa).then(a.cmp(b))
        });
        tips
    }

    pub fn tip_count(&self) -> usize {
        self.tips.len()
    }

    // ─── Traversal ──────────────────────────────────────────────────

    /// Walk parents from `hash` while the node sits above height `h`.
    /// Yields the ancestor at height `h`, or `None` when `hash` is unknown
    /// or already below `h`.
    pub fn get_predecessor(&self, hash: &Hash256, h: u64) -> Option<Hash256> {
        let mut id = *self.index.get(hash)?;
        loop {
            let node = &self.nodes[id as usize];
            if node.height == h {
                return Some(node.hash);
            }
            if node.height < h {
                return None;
            }
            id = node.parent?;
        }
    }

    /// Inclusive path from `hash` down to height `h_until`, oldest first
    pub fn chain_back(&self, hash: &Hash256, h_until: u64) -> Vec<Hash256> {
        let mut path = Vec::new();
        let mut id = match self.index.get(hash) {
            Some(id) => *id,
            None => return path,
        };
        loop {
            let node = &self.nodes[id as usize];
            if node.height < h_until {
                break;
            }
            path.push(node.hash);
            match node.parent {
                Some(p) if node.height > h_until => id = p,
                _ => break,
            }
        }
        path.reverse();
        path
    }

    /// Is `a` an ancestor of (or equal to) `b`?
    pub fn is_ancestor_or_equal(&self, a: &Hash256, b: &Hash256) -> bool {
        match (self.get_height(a), self.get_height(b)) {
            (Some(ha), Some(hb)) if ha <= hb => self.get_predecessor(b, ha) == Some(*a),
            _ => false,
        }
    }

    /// Every descendant of `locator`, BFS over child pointers, returned in
    /// (height, hash) order. Unknown locators yield an empty list.
    pub fn get_hashes_after(&self, locator: &Hash256) -> Vec<Hash256> {
        let start = match self.index.get(locator) {
            Some(id) => *id,
            None => return Vec::new(),
        };
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start);
        while let Some(id) = queue.pop_front() {
            for child in &self.nodes[id as usize].children {
                let node = &self.nodes[*child as usize];
                found.insert((node.height, node.hash));
                queue.push_back(*child);
            }
        }
        found.into_iter().map(|(_, h)| h).collect()
    }

    /// Hashes whose timestamps fall within the range, in (height, hash) order
    pub fn hashes_in_time_range(&self, from_ms: u64, until_ms: u64) -> Vec<Hash256> {
        self.ordered
            .iter()
            .filter(|(_, hash)| {
                let ts = self.node(hash).unwrap().timestamp_ms;
                ts >= from_ms && ts <= until_ms
            })
            .map(|(_, h)| *h)
            .collect()
    }

    /// All hashes in (height, hash) order
    pub fn all_hashes(&self) -> Vec<Hash256> {
        self.ordered.iter().map(|(_, h)| *h).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: u32 = 0x2100ffff;

    fn h(byte: u8) -> Hash256 {
        [byte; 32]
    }

    fn chain() -> HashChain {
        HashChain::new(h(0), 1000, TARGET, 100)
    }

    #[test]
    fn test_add_links_height_and_weight() {
        let mut c = chain();
        let genesis_weight = c.get_weight(&h(0)).unwrap();
        c.add(h(1), h(0), 2000, TARGET).unwrap();
        c.add(h(2), h(1), 3000, TARGET).unwrap();

        assert_eq!(c.get_height(&h(1)), Some(1));
        assert_eq!(c.get_height(&h(2)), Some(2));
        assert_eq!(c.get_weight(&h(1)), Some(genesis_weight + target_to_work(TARGET)));
        assert_eq!(c.get_weight(&h(2)), Some(genesis_weight + 2 * target_to_work(TARGET)));
        assert_eq!(c.num_hashes(), 3);
    }

    #[test]
    fn test_missing_parent() {
        let mut c = chain();
        assert!(matches!(c.add(h(1), h(9), 2000, TARGET), Err(FlowError::MissingParent)));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut c = chain();
        c.add(h(1), h(0), 2000, TARGET).unwrap();
        assert!(matches!(c.add(h(1), h(0), 2000, TARGET), Err(FlowError::DuplicateBlock)));
    }

    #[test]
    fn test_tip_set_transitions() {
        let mut c = chain();
        assert!(c.is_tip(&h(0)));
        c.add(h(1), h(0), 2000, TARGET).unwrap();
        assert!(!c.is_tip(&h(0)));
        assert!(c.is_tip(&h(1)));
        // A fork keeps both branch heads as tips
        c.add(h(2), h(0), 2500, TARGET).unwrap();
        assert!(c.is_tip(&h(1)));
        assert!(c.is_tip(&h(2)));
        assert_eq!(c.tip_count(), 2);
    }

    #[test]
    fn test_best_tip_tie_breaks_to_smaller_hash() {
        let mut c = chain();
        // Same parent, same target => equal weight
        c.add(h(5), h(0), 2000, TARGET).unwrap();
        c.add(h(3), h(0), 2100, TARGET).unwrap();
        assert_eq!(c.best_tip(), h(3));
    }

    #[test]
    fn test_predecessor_and_chain_back() {
        let mut c = chain();
        c.add(h(1), h(0), 2000, TARGET).unwrap();
        c.add(h(2), h(1), 3000, TARGET).unwrap();
        c.add(h(3), h(2), 4000, TARGET).unwrap();

        assert_eq!(c.get_predecessor(&h(3), 1), Some(h(1)));
        assert_eq!(c.get_predecessor(&h(3), 3), Some(h(3)));
        assert_eq!(c.get_predecessor(&h(1), 2), None);
        assert_eq!(c.chain_back(&h(3), 1), vec![h(1), h(2), h(3)]);
        assert_eq!(c.chain_back(&h(3), 0), vec![h(0), h(1), h(2), h(3)]);
    }

    #[test]
    fn test_is_ancestor_or_equal() {
        let mut c = chain();
        c.add(h(1), h(0), 2000, TARGET).unwrap();
        c.add(h(2), h(1), 3000, TARGET).unwrap();
        c.add(h(9), h(0), 2500, TARGET).unwrap();

        assert!(c.is_ancestor_or_equal(&h(0), &h(2)));
        assert!(c.is_ancestor_or_equal(&h(1), &h(2)));
        assert!(c.is_ancestor_or_equal(&h(2), &h(2)));
        assert!(!c.is_ancestor_or_equal(&h(2), &h(1)));
        assert!(!c.is_ancestor_or_equal(&h(9), &h(2)));
    }

    #[test]
    fn test_hashes_after_bfs_in_height_order() {
        let mut c = chain();
        c.add(h(1), h(0), 2000, TARGET).unwrap();
        c.add(h(2), h(1), 3000, TARGET).unwrap();
        c.add(h(4), h(1), 3100, TARGET).unwrap();
        c.add(h(3), h(2), 4000, TARGET).unwrap();

        let after_genesis = c.get_hashes_after(&h(0));
        assert_eq!(after_genesis, vec![h(1), h(2), h(4), h(3)]);
        assert_eq!(c.get_hashes_after(&h(2)), vec![h(3)]);
        assert!(c.get_hashes_after(&h(77)).is_empty());
    }

    #[test]
    fn test_tip_pruning_bounds_tip_set() {
        let mut c = HashChain::new(h(0), 1000, TARGET, 4);
        // A stale fork right off genesis
        c.add(h(200), h(0), 1500, TARGET).unwrap();
        // Grow the main branch well past the prune interval
        let mut parent = h(0);
        for i in 1..=10u8 {
            c.add(h(i), parent, 1000 + i as u64 * 1000, TARGET).unwrap();
            parent = h(i);
        }
        assert!(!c.is_tip(&h(200)));
        assert!(c.is_tip(&h(10)));
        // The node itself is still in the arena
        assert!(c.contains(&h(200)));
        assert_eq!(c.get_height(&h(200)), Some(1));
    }
}
