//! Header chain: the hash index plus header storage and the difficulty
//! adjustment rule.
//!
//! The adjustment is DigiShield-style: compare the median timestamp of the
//! window ending at the parent against the window ending at the
//! grandparent, damp the deviation by 4, clamp the span, and scale the
//! parent's target proportionally. Big-integer math throughout — compact
//! targets are expanded to 256 bits, scaled with floor division, and
//! re-compacted.

use num_bigint::BigUint;
use std::collections::HashMap;

use crate::core::params::ConsensusParams;
use crate::core::types::*;
use crate::flow::hash_chain::HashChain;
use crate::flow::FlowError;
use crate::pow::{compact_to_target, target_to_compact};

pub struct HeaderChain {
    chain: HashChain,
    headers: HashMap<Hash256, BlockHeader>,
    chain_index: ChainIndex,
    params: ConsensusParams,
}

impl HeaderChain {
    pub fn new(chain_index: ChainIndex, genesis: &BlockHeader, params: ConsensusParams) -> Self {
        let genesis_hash = genesis.hash();
        let chain = HashChain::new(
            genesis_hash,
            genesis.timestamp_ms,
            genesis.target,
            params.tips_prune_interval,
        );
        let mut headers = HashMap::new();
        headers.insert(genesis_hash, genesis.clone());
        HeaderChain { chain, headers, chain_index, params }
    }

    pub fn chain_index(&self) -> ChainIndex {
        self.chain_index
    }

    pub fn hash_chain(&self) -> &HashChain {
        &self.chain
    }

    pub fn get_header(&self, hash: &Hash256) -> Option<&BlockHeader> {
        self.headers.get(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.chain.contains(hash)
    }

    /// Validate and index a header. The parent must already be present and
    /// the header's target must equal the value the adjustment rule derives
    /// from its parent.
    pub fn add(&mut self, header: &BlockHeader) -> Result<Hash256, FlowError> {
        let hash = header.hash();
        if self.chain.contains(&hash) {
            return Err(FlowError::DuplicateBlock);
        }
        let parent_hash = header.parent().ok_or(FlowError::MissingParent)?;
        let parent = self.chain.node(&parent_hash).ok_or(FlowError::MissingParent)?;
        if header.timestamp_ms <= parent.timestamp_ms {
            return Err(FlowError::InvalidTimestamp);
        }

        let expected = self.next_target_after(&parent_hash)?;
        if header.target != expected {
            return Err(FlowError::InvalidTarget { expected, got: header.target });
        }

        self.chain.add(hash, parent_hash, header.timestamp_ms, header.target)?;
        self.headers.insert(hash, header.clone());
        Ok(hash)
    }

    // ─── Difficulty Adjustment ──────────────────────────────────────

    /// The target a block extending `parent_hash` must carry. Mining calls
    /// this to stamp templates; validation calls it to check accepted
    /// headers, so both sides derive the same value.
    pub fn next_target_after(&self, parent_hash: &Hash256) -> Result<u32, FlowError> {
        let parent = self.chain.node(parent_hash).ok_or(FlowError::MissingParent)?;

        let m1 = self.median_timestamp(parent_hash);
        let m2 = parent
            .height
            .checked_sub(1)
            .and_then(|h| self.chain.get_predecessor(parent_hash, h))
            .and_then(|gp| self.median_timestamp(&gp));

        let (m1, m2) = match (m1, m2) {
            (Some(a), Some(b)) => (a, b),
            // Chain too short for two full windows: keep the parent's target
            _ => return Ok(parent.target),
        };

        let expected = self.params.expected_time_span_ms as i128;
        let damped = expected + (m1 as i128 - m2 as i128 - expected) / 4;
        let span = damped.clamp(
            self.params.time_span_min_ms as i128,
            self.params.time_span_max_ms as i128,
        ) as u64;

        let parent_target = compact_to_target(parent.target);
        let scaled = parent_target * BigUint::from(span)
            / BigUint::from(self.params.expected_time_span_ms);
        let capped = scaled.min(compact_to_target(self.params.max_mining_target));
        Ok(target_to_compact(&capped))
    }

    /// Median of the last `median_time_interval` timestamps ending at
    /// `hash` (inclusive). Undefined while the chain is shorter than the
    /// window.
    fn median_timestamp(&self, hash: &Hash256) -> Option<u64> {
        let window = self.params.median_time_interval;
        let node = self.chain.node(hash)?;
        if (node.height + 1) < window as u64 {
            return None;
        }
        let start = node.height + 1 - window as u64;
        let path = self.chain.chain_back(hash, start);
        if path.len() < window {
            return None;
        }
        let mut timestamps: Vec<u64> = path
            .iter()
            .map(|h| self.chain.get_timestamp(h).unwrap())
            .collect();
        timestamps.sort_unstable();
        Some(timestamps[window / 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow::target_to_work;

    const GENESIS_TARGET: u32 = 0x1d00ffff;

    fn test_params() -> ConsensusParams {
        ConsensusParams {
            groups: 1,
            median_time_interval: 17,
            expected_time_span_ms: 64_000,
            time_span_min_ms: 16_000,
            time_span_max_ms: 256_000,
            max_mining_target: 0x2100ffff,
            ..ConsensusParams::default()
        }
    }

    fn genesis_header() -> BlockHeader {
        BlockHeader {
            deps: BlockDeps::empty(),
            txs_root: NULL_HASH,
            timestamp_ms: 1_000_000,
            target: GENESIS_TARGET,
            nonce: 0,
        }
    }

    fn child_of(hc: &HeaderChain, parent: Hash256, timestamp_ms: u64, nonce: u64) -> BlockHeader {
        BlockHeader {
            deps: BlockDeps(vec![parent]),
            txs_root: NULL_HASH,
            timestamp_ms,
            target: hc.next_target_after(&parent).unwrap(),
            nonce,
        }
    }

    /// Grow a chain with constant inter-block gaps; returns the tip hash.
    fn grow(hc: &mut HeaderChain, mut parent: Hash256, blocks: usize, gap_ms: u64) -> Hash256 {
        for i in 0..blocks {
            let parent_ts = hc.hash_chain().get_timestamp(&parent).unwrap();
            let header = child_of(hc, parent, parent_ts + gap_ms, i as u64);
            parent = hc.add(&header).unwrap();
        }
        parent
    }

    #[test]
    fn test_add_requires_known_parent() {
        let params = test_params();
        let genesis = genesis_header();
        let mut hc = HeaderChain::new(ChainIndex::new(0, 0), &genesis, params);
        let orphan = BlockHeader {
            deps: BlockDeps(vec![[9u8; 32]]),
            txs_root: NULL_HASH,
            timestamp_ms: 2_000_000,
            target: GENESIS_TARGET,
            nonce: 0,
        };
        assert!(matches!(hc.add(&orphan), Err(FlowError::MissingParent)));
    }

    #[test]
    fn test_short_chain_reuses_parent_target() {
        let params = test_params();
        let genesis = genesis_header();
        let hc = HeaderChain::new(ChainIndex::new(0, 0), &genesis, params);
        assert_eq!(hc.next_target_after(&genesis.hash()).unwrap(), GENESIS_TARGET);
    }

    #[test]
    fn test_wrong_target_rejected() {
        let params = test_params();
        let genesis = genesis_header();
        let mut hc = HeaderChain::new(ChainIndex::new(0, 0), &genesis, params);
        let bad = BlockHeader {
            deps: BlockDeps(vec![genesis.hash()]),
            txs_root: NULL_HASH,
            timestamp_ms: 2_000_000,
            target: 0x1c00ffff,
            nonce: 0,
        };
        assert!(matches!(hc.add(&bad), Err(FlowError::InvalidTarget { .. })));
    }

    #[test]
    fn test_height_and_weight_invariants() {
        let params = test_params();
        let genesis = genesis_header();
        let mut hc = HeaderChain::new(ChainIndex::new(0, 0), &genesis, params);
        let g = genesis.hash();
        let tip = grow(&mut hc, g, 3, 64_000);
        let chain = hc.hash_chain();
        assert_eq!(chain.get_height(&tip), Some(3));
        let parent = chain.get_predecessor(&tip, 2).unwrap();
        let tip_target = chain.get_target(&tip).unwrap();
        assert_eq!(
            chain.get_weight(&tip),
            Some(chain.get_weight(&parent).unwrap() + target_to_work(tip_target)),
        );
    }

    #[test]
    fn test_on_pace_blocks_keep_target() {
        let params = test_params();
        let genesis = genesis_header();
        let mut hc = HeaderChain::new(ChainIndex::new(0, 0), &genesis, params);
        let tip = grow(&mut hc, genesis.hash(), 40, 64_000);
        // Median spacing equals the expected span, so the target is stable
        assert_eq!(hc.next_target_after(&tip).unwrap(), GENESIS_TARGET);
    }

    #[test]
    fn test_slow_blocks_ease_target_with_clamp() {
        // Gaps of 1024s shift the window medians by 1024s: damped span =
        // 64 + (1024 - 64)/4 = 304s, clamped to 256s, so the very first
        // adjusted target scales by 256/64 = 4x (easier).
        let params = test_params();
        let genesis = genesis_header();
        let mut hc = HeaderChain::new(ChainIndex::new(0, 0), &genesis, params);
        let tip = grow(&mut hc, genesis.hash(), 17, 1_024_000);
        let next = hc.next_target_after(&tip).unwrap();
        let expected = compact_to_target(GENESIS_TARGET) * BigUint::from(4u32);
        assert_eq!(compact_to_target(next), expected);
    }

    #[test]
    fn test_fast_blocks_tighten_target() {
        // 1s gaps: damped span = 64 + (1 - 64)/4 ≈ 48s, target shrinks
        let params = test_params();
        let genesis = genesis_header();
        let mut hc = HeaderChain::new(ChainIndex::new(0, 0), &genesis, params);
        let tip = grow(&mut hc, genesis.hash(), 17, 1_000);
        let next = hc.next_target_after(&tip).unwrap();
        assert!(compact_to_target(next) < compact_to_target(GENESIS_TARGET));
    }

    #[test]
    fn test_target_monotone_in_time_span() {
        // Larger median span => larger (easier) target
        let params = test_params();
        let genesis = genesis_header();

        let mut slow = HeaderChain::new(ChainIndex::new(0, 0), &genesis, params.clone());
        let slow_tip = grow(&mut slow, genesis.hash(), 17, 128_000);

        let mut fast = HeaderChain::new(ChainIndex::new(0, 0), &genesis, params);
        let fast_tip = grow(&mut fast, genesis.hash(), 17, 32_000);

        let eased = compact_to_target(slow.next_target_after(&slow_tip).unwrap());
        let tightened = compact_to_target(fast.next_target_after(&fast_tip).unwrap());
        assert!(eased > compact_to_target(GENESIS_TARGET));
        assert!(tightened < compact_to_target(GENESIS_TARGET));
    }
}
