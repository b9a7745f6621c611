//! Mining templates: dependency selection, transaction selection, and the
//! coinbase. The nonce search itself runs in an external worker; this
//! module produces everything the worker needs and defines the
//! deterministic execution order both the builder and block validation
//! replay.

use crate::core::params::{block_reward, MAX_BLOCK_SIZE};
use crate::core::types::*;
use crate::flow::{BlockFlow, FlowError};
use crate::mempool::MemPool;

/// Per-group payout lockups for locally mined blocks
pub struct MinerConfig {
    pub miner_lockups: Vec<LockupScript>,
}

impl MinerConfig {
    pub fn single(lockup: LockupScript, groups: u32) -> Self {
        MinerConfig { miner_lockups: vec![lockup; groups as usize] }
    }

    pub fn lockup_for(&self, group: GroupIndex) -> &LockupScript {
        &self.miner_lockups[group as usize]
    }
}

/// Everything a worker needs to grind one block
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub chain_index: ChainIndex,
    pub deps: BlockDeps,
    pub target: u32,
    pub timestamp_ms: u64,
    pub txs_root: Hash256,
    pub transactions: Vec<Transaction>,
}

impl BlockTemplate {
    pub fn into_block(self, nonce: u64) -> Block {
        Block {
            header: BlockHeader {
                deps: self.deps,
                txs_root: self.txs_root,
                timestamp_ms: self.timestamp_ms,
                target: self.target,
                nonce,
            },
            transactions: self.transactions,
        }
    }
}

/// Assemble a template for one chain. The deps come from the group's best
/// consistent view, so the template is valid given the view implied by the
/// chosen deps on every other chain.
pub fn build_template(
    flow: &BlockFlow,
    mempool: &MemPool,
    config: &MinerConfig,
    chain_index: ChainIndex,
    tx_limit: usize,
    now_ms: u64,
) -> Result<BlockTemplate, FlowError> {
    let deps = flow.template_deps(chain_index)?;
    let parent = deps.parent().expect("template deps carry the direct parent");

    let (world, parent_ts, parent_height, target) =
        flow.multi_chain().read(chain_index, |chain| {
            let hc = chain.header_chain().hash_chain();
            (
                chain.world_state_at(&parent),
                hc.get_timestamp(&parent).unwrap_or(0),
                hc.get_height(&parent).unwrap_or(0),
                chain.next_target_after(&parent),
            )
        });
    let world = world?;
    let target = target?;

    // Select ready txs, re-checking spendability against a scratch state
    // so chained pool txs stay valid in selection order
    let candidates = mempool.extract_ready_txs(&world, tx_limit.saturating_sub(1));
    let mut selected: Vec<Transaction> = Vec::new();
    let mut scratch = world;
    let mut fees: u64 = 0;
    let mut block_size = 0usize;
    for tx in candidates {
        let tx_size = tx.size();
        if block_size + tx_size > MAX_BLOCK_SIZE {
            break;
        }
        if !scratch.contains_all_inputs(&tx) {
            continue;
        }
        let input_sum: u64 = tx
            .unsigned
            .inputs
            .iter()
            .filter_map(|r| scratch.get(r))
            .map(|o| o.amount)
            .sum();
        let output_sum = tx.total_output();
        if output_sum > input_sum {
            continue;
        }
        match scratch.apply(&tx) {
            Ok(next) => scratch = next,
            Err(_) => continue,
        }
        fees += input_sum - output_sum;
        block_size += tx_size;
        selected.push(tx);
    }

    let reward = block_reward(parent_height + 1);
    let coinbase =
        Transaction::new_coinbase(reward + fees, config.lockup_for(chain_index.to).clone());
    selected.push(coinbase);

    let template = BlockTemplate {
        chain_index,
        deps,
        target,
        timestamp_ms: now_ms.max(parent_ts + 1),
        txs_root: Block::compute_txs_root(&selected),
        transactions: selected,
    };
    tracing::debug!(
        "⚒️  Template for chain {}: {} txs, target {:#010x}",
        chain_index,
        template.transactions.len(),
        template.target,
    );
    Ok(template)
}

// ─── Execution Order ────────────────────────────────────────────────

/// Deterministic order for executing a block's non-coinbase transactions.
///
/// Scripted txs run first, permuted by a Fisher–Yates walk whose seed is
/// `parent ⊕ hash(tx[0]) ⊕ hash(tx[mid]) ⊕ hash(tx[last])` and steps to
/// the picked tx's hash each iteration; plain txs follow in their original
/// positions. Any validator re-derives the same order from the block
/// alone, which blunts intra-block front-running.
pub fn non_coinbase_execution_order(parent_hash: &Hash256, txs: &[Transaction]) -> Vec<usize> {
    let scripted: Vec<usize> = (0..txs.len()).filter(|&i| txs[i].has_script()).collect();
    let plain: Vec<usize> = (0..txs.len()).filter(|&i| !txs[i].has_script()).collect();

    let mut order = scripted;
    if order.len() > 1 {
        let mut seed = *parent_hash;
        seed = xor_hash(&seed, &txs[0].hash());
        seed = xor_hash(&seed, &txs[txs.len() / 2].hash());
        seed = xor_hash(&seed, &txs[txs.len() - 1].hash());
        for i in (1..order.len()).rev() {
            let word = u64::from_le_bytes(seed[0..8].try_into().unwrap());
            let j = (word % (i as u64 + 1)) as usize;
            order.swap(i, j);
            seed = txs[order[i]].hash();
        }
    }
    order.extend(plain);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::test_support::*;

    fn plain_tx(input_byte: u8) -> Transaction {
        Transaction {
            unsigned: UnsignedTx {
                inputs: vec![AssetOutputRef { tx_hash: [input_byte; 32], index: 0 }],
                fixed_outputs: vec![TxOutput { amount: 1, lockup: LockupScript::P2pkh([1; 32]) }],
                script: None,
            },
            signatures: Vec::new(),
            generated_outputs: Vec::new(),
        }
    }

    fn scripted_tx(input_byte: u8) -> Transaction {
        let mut tx = plain_tx(input_byte);
        tx.unsigned.script = Some(vec![input_byte]);
        tx
    }

    #[test]
    fn test_execution_order_scripted_before_plain() {
        let parent = [0x01; 32];
        let txs = vec![scripted_tx(10), plain_tx(11), scripted_tx(12), scripted_tx(13)];
        let order = non_coinbase_execution_order(&parent, &txs);

        assert_eq!(order.len(), 4);
        // A permutation of the scripted positions, then the plain ones
        let mut head: Vec<usize> = order[..3].to_vec();
        head.sort_unstable();
        assert_eq!(head, vec![0, 2, 3]);
        assert_eq!(order[3], 1);
    }

    #[test]
    fn test_execution_order_deterministic() {
        let parent = [0x01; 32];
        let txs = vec![scripted_tx(10), plain_tx(11), scripted_tx(12), scripted_tx(13)];
        assert_eq!(
            non_coinbase_execution_order(&parent, &txs),
            non_coinbase_execution_order(&parent, &txs),
        );
        // A different parent reshuffles (with overwhelming likelihood for
        // this fixed fixture)
        let other = non_coinbase_execution_order(&[0x02; 32], &txs);
        assert_eq!(other[3], 1);
    }

    #[test]
    fn test_execution_order_empty_and_single() {
        assert!(non_coinbase_execution_order(&[0x01; 32], &[]).is_empty());
        let txs = vec![scripted_tx(9)];
        assert_eq!(non_coinbase_execution_order(&[0x01; 32], &txs), vec![0]);
    }

    #[test]
    fn test_template_contains_ready_txs_and_fee_paying_coinbase() {
        let f = TestFixture::new(1);
        let ci = ChainIndex::new(0, 0);
        let genesis = f.best_tip(ci);

        // Fund the fixture key, then queue a spend paying a 1.5 COIN fee
        let b1 = f.make_block(ci, vec![genesis], vec![]);
        let b1_hash = f.flow.add_block(&b1).unwrap();
        let coinbase_ref = AssetOutputRef { tx_hash: b1.coinbase().unwrap().hash(), index: 0 };
        let spend = f.signed_transfer(coinbase_ref, crate::core::params::COIN, [7u8; 32]);
        let fee = crate::core::params::block_reward(1) - crate::core::params::COIN;

        let mempool = MemPool::new(0, crate::config::MempoolConfig::default());
        let world = f.world_state_at(ci, &b1_hash);
        assert!(mempool.add(&spend, 1, &world));

        let config = MinerConfig::single(LockupScript::P2pkh(f.keypair.lockup_hash()), 1);
        let template =
            build_template(&f.flow, &mempool, &config, ci, 100, b1.header.timestamp_ms + 1)
                .unwrap();

        assert_eq!(template.deps.parent(), Some(b1_hash));
        assert_eq!(template.transactions.len(), 2);
        assert_eq!(template.transactions[0], spend);
        let coinbase = template.transactions.last().unwrap();
        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.total_output(), crate::core::params::block_reward(2) + fee);
        assert!(template.timestamp_ms > b1.header.timestamp_ms);

        // The template grinds into a block the flow accepts
        let mut block = template.into_block(0);
        f.grind(ci, &mut block.header);
        f.flow.add_block(&block).unwrap();
    }

    #[test]
    fn test_template_tx_limit() {
        let f = TestFixture::new(1);
        let ci = ChainIndex::new(0, 0);
        let genesis = f.best_tip(ci);
        let b1 = f.make_block(ci, vec![genesis], vec![]);
        f.flow.add_block(&b1).unwrap();

        let mempool = MemPool::new(0, crate::config::MempoolConfig::default());
        let config = MinerConfig::single(LockupScript::P2pkh(f.keypair.lockup_hash()), 1);
        // limit of 1 leaves room for the coinbase only
        let template = build_template(&f.flow, &mempool, &config, ci, 1, 0).unwrap();
        assert_eq!(template.transactions.len(), 1);
        assert!(template.transactions[0].is_coinbase());
    }
}
