use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte hash used throughout the system
pub type Hash256 = [u8; 32];

/// Null hash (all zeros), used for genesis roots and unset fields
pub const NULL_HASH: Hash256 = [0u8; 32];

/// Index of a shard group
pub type GroupIndex = u32;

/// XOR two 32-byte hashes (used for execution-order seeding)
pub fn xor_hash(a: &Hash256, b: &Hash256) -> Hash256 {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

// ─── Chain Index ─────────────────────────────────────────────────────

/// Identifies one of the `G × G` chains by its ordered group pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChainIndex {
    pub from: GroupIndex,
    pub to: GroupIndex,
}

impl ChainIndex {
    pub fn new(from: GroupIndex, to: GroupIndex) -> Self {
        ChainIndex { from, to }
    }

    /// Flat position in the dense `G²` chain array
    pub fn flat_index(&self, groups: u32) -> usize {
        (self.from * groups + self.to) as usize
    }

    pub fn from_flat_index(flat: usize, groups: u32) -> Self {
        ChainIndex {
            from: flat as u32 / groups,
            to: flat as u32 % groups,
        }
    }

    /// Derive the chain a header belongs to from its hash: `hash mod G²`
    pub fn from_hash(hash: &Hash256, groups: u32) -> Self {
        let word = u64::from_le_bytes(hash[0..8].try_into().unwrap());
        Self::from_flat_index((word % (groups as u64 * groups as u64)) as usize, groups)
    }

    pub fn is_intra_group(&self) -> bool {
        self.from == self.to
    }
}

impl fmt::Display for ChainIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.from, self.to)
    }
}

// ─── Block Dependencies ──────────────────────────────────────────────

/// The `2·G − 1` cross-chain dependencies of a block on chain `(from, to)`.
///
/// Layout, for `G` groups:
///   [0, G−1)      incoming deps — one block on the intra-group chain
///                 `(g, g)` for each group `g != from`, ascending `g`
///   [G−1, 2G−2)   outgoing deps — one block on chain `(from, t)` for each
///                 target `t != to`, ascending `t`
///   2G−2          the direct parent on `(from, to)`
///
/// Genesis blocks carry an empty vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockDeps(pub Vec<Hash256>);

impl BlockDeps {
    pub fn empty() -> Self {
        BlockDeps(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The direct parent on the block's own chain (last slot)
    pub fn parent(&self) -> Option<Hash256> {
        self.0.last().copied()
    }

    pub fn incoming(&self, groups: u32) -> &[Hash256] {
        &self.0[..(groups as usize - 1)]
    }

    pub fn outgoing(&self, groups: u32) -> &[Hash256] {
        &self.0[(groups as usize - 1)..(2 * groups as usize - 2)]
    }

    /// The chain each dep slot must live on, for a block on `chain_index`.
    ///
    /// Slot `i` maps to: intra-group chain `(g, g)` for the i-th group
    /// `g != from` (incoming), then `(from, t)` for the i-th target
    /// `t != to` (outgoing), then `(from, to)` itself.
    pub fn slot_chain(chain_index: ChainIndex, slot: usize, groups: u32) -> ChainIndex {
        let g = groups as usize;
        if slot < g - 1 {
            let group = (0..groups).filter(|&x| x != chain_index.from).nth(slot).unwrap();
            ChainIndex::new(group, group)
        } else if slot < 2 * g - 2 {
            let t = (0..groups)
                .filter(|&x| x != chain_index.to)
                .nth(slot - (g - 1))
                .unwrap();
            ChainIndex::new(chain_index.from, t)
        } else {
            chain_index
        }
    }

    /// Locate the dep for `target` within a block on `chain_index`.
    /// Returns `None` when no slot covers `target` (deps only span chains
    /// touching `from`).
    pub fn dep_for_chain(
        &self,
        chain_index: ChainIndex,
        target: ChainIndex,
        groups: u32,
    ) -> Option<Hash256> {
        if self.is_empty() {
            return None;
        }
        let slots = 2 * groups as usize - 1;
        (0..slots)
            .find(|&i| Self::slot_chain(chain_index, i, groups) == target)
            .map(|i| self.0[i])
    }
}

// ─── Block Header ────────────────────────────────────────────────────

/// Block header. The chain a block belongs to is not a field: it is
/// derived from the header hash (`hash mod G²`), so the miner grinds the
/// nonce until the hash both meets the target and lands on the intended
/// chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub deps: BlockDeps,
    /// Flat hash over the serialized transaction list
    pub txs_root: Hash256,
    /// Milliseconds since the unix epoch
    pub timestamp_ms: u64,
    /// Compact difficulty target (exponent/mantissa encoding)
    pub target: u32,
    pub nonce: u64,
}

impl BlockHeader {
    /// Proof-of-work hash of the header (blake3 over the serialized bytes)
    pub fn hash(&self) -> Hash256 {
        let serialized = bincode::serialize(self).expect("header serialization failed");
        crate::pow::pow_hash(&serialized)
    }

    pub fn chain_index(&self, groups: u32) -> ChainIndex {
        ChainIndex::from_hash(&self.hash(), groups)
    }

    pub fn parent(&self) -> Option<Hash256> {
        self.deps.parent()
    }

    pub fn is_genesis(&self) -> bool {
        self.deps.is_empty()
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block [{}] target={:#010x} ts={}",
            hex::encode(self.hash()),
            self.target,
            self.timestamp_ms,
        )
    }
}

// ─── Transactions ────────────────────────────────────────────────────

/// Reference to an asset output: `(tx hash, output index)`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetOutputRef {
    pub tx_hash: Hash256,
    pub index: u32,
}

/// Reference to a contract output — disjoint from asset refs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ContractOutputRef {
    pub tx_hash: Hash256,
    pub index: u32,
}

/// Script that locks an output to its owner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockupScript {
    /// Pay to a 32-byte public key hash
    P2pkh(Hash256),
}

impl LockupScript {
    pub fn p2pkh_hash(&self) -> &Hash256 {
        match self {
            LockupScript::P2pkh(h) => h,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    pub amount: u64,
    pub lockup: LockupScript,
}

/// The signed-over part of a transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsignedTx {
    pub inputs: Vec<AssetOutputRef>,
    pub fixed_outputs: Vec<TxOutput>,
    /// Opaque script body; execution is a collaborator concern
    pub script: Option<Vec<u8>>,
}

impl UnsignedTx {
    /// Transaction id: double SHA-256 over the serialized unsigned body
    pub fn hash(&self) -> Hash256 {
        let serialized = bincode::serialize(self).expect("tx serialization failed");
        crate::crypto::double_sha256(&serialized)
    }
}

/// One signature per input, paired with the signing pubkey
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputSignature {
    pub pubkey: Vec<u8>,
    pub signature: Vec<u8>,
}

/// A template is a transaction before execution: no generated-outputs tail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxTemplate {
    pub unsigned: UnsignedTx,
    pub signatures: Vec<InputSignature>,
}

/// A complete transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub unsigned: UnsignedTx,
    pub signatures: Vec<InputSignature>,
    /// Outputs produced by script execution, appended after the fixed ones
    pub generated_outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn from_template(template: TxTemplate) -> Self {
        Transaction {
            unsigned: template.unsigned,
            signatures: template.signatures,
            generated_outputs: Vec::new(),
        }
    }

    /// Create a coinbase transaction. Coinbase txs have no inputs; the
    /// reward (plus fees) goes to the miner's lockup for the target group.
    pub fn new_coinbase(reward: u64, miner_lockup: LockupScript) -> Self {
        Transaction {
            unsigned: UnsignedTx {
                inputs: Vec::new(),
                fixed_outputs: vec![TxOutput {
                    amount: reward,
                    lockup: miner_lockup,
                }],
                script: None,
            },
            signatures: Vec::new(),
            generated_outputs: Vec::new(),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.unsigned.inputs.is_empty()
    }

    pub fn has_script(&self) -> bool {
        self.unsigned.script.is_some()
    }

    pub fn hash(&self) -> Hash256 {
        self.unsigned.hash()
    }

    /// Fixed outputs followed by execution-generated ones, with their
    /// output indexes
    pub fn all_outputs(&self) -> impl Iterator<Item = (u32, &TxOutput)> {
        self.unsigned
            .fixed_outputs
            .iter()
            .chain(self.generated_outputs.iter())
            .enumerate()
            .map(|(i, o)| (i as u32, o))
    }

    pub fn total_output(&self) -> u64 {
        self.all_outputs().map(|(_, o)| o.amount).sum()
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(0) as usize
    }
}

// ─── Block ───────────────────────────────────────────────────────────

/// A complete block. The **last** transaction is the coinbase; the
/// non-coinbase prefix carries user transactions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.last()
    }

    pub fn non_coinbase(&self) -> &[Transaction] {
        if self.transactions.is_empty() {
            &[]
        } else {
            &self.transactions[..self.transactions.len() - 1]
        }
    }

    /// Flat root over the serialized transaction list
    pub fn compute_txs_root(transactions: &[Transaction]) -> Hash256 {
        let serialized = bincode::serialize(transactions).expect("txs serialization failed");
        crate::crypto::double_sha256(&serialized)
    }

    pub fn validate_txs_root(&self) -> bool {
        self.header.txs_root == Self::compute_txs_root(&self.transactions)
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(byte: u8) -> Hash256 {
        [byte; 32]
    }

    #[test]
    fn test_chain_index_round_trip() {
        let groups = 4;
        for flat in 0..16 {
            let ci = ChainIndex::from_flat_index(flat, groups);
            assert_eq!(ci.flat_index(groups), flat);
        }
    }

    #[test]
    fn test_chain_index_from_hash_in_range() {
        let groups = 4;
        for b in 0..64u8 {
            let ci = ChainIndex::from_hash(&h(b), groups);
            assert!(ci.from < groups && ci.to < groups);
        }
    }

    #[test]
    fn test_deps_slot_chains_cover_all_related_chains() {
        let groups = 4;
        let ci = ChainIndex::new(1, 2);
        let slots = 2 * groups as usize - 1;
        let chains: Vec<ChainIndex> = (0..slots)
            .map(|i| BlockDeps::slot_chain(ci, i, groups))
            .collect();
        // Incoming: intra-group chains of every group but `from`
        assert_eq!(chains[0], ChainIndex::new(0, 0));
        assert_eq!(chains[1], ChainIndex::new(2, 2));
        assert_eq!(chains[2], ChainIndex::new(3, 3));
        // Outgoing: (from, t) for t != to
        assert_eq!(chains[3], ChainIndex::new(1, 0));
        assert_eq!(chains[4], ChainIndex::new(1, 1));
        assert_eq!(chains[5], ChainIndex::new(1, 3));
        // Parent slot
        assert_eq!(chains[6], ci);
        // No duplicates
        let unique: std::collections::HashSet<_> = chains.iter().collect();
        assert_eq!(unique.len(), slots);
    }

    #[test]
    fn test_dep_for_chain_lookup() {
        let groups = 2;
        let ci = ChainIndex::new(0, 1);
        // G=2: slots = [ (1,1) incoming, (0,0) outgoing, (0,1) parent ]
        let deps = BlockDeps(vec![h(0xAA), h(0xBB), h(0xCC)]);
        assert_eq!(deps.dep_for_chain(ci, ChainIndex::new(1, 1), groups), Some(h(0xAA)));
        assert_eq!(deps.dep_for_chain(ci, ChainIndex::new(0, 0), groups), Some(h(0xBB)));
        assert_eq!(deps.dep_for_chain(ci, ci, groups), Some(h(0xCC)));
        assert_eq!(deps.dep_for_chain(ci, ChainIndex::new(1, 0), groups), None);
    }

    #[test]
    fn test_coinbase_transaction() {
        let tx = Transaction::new_coinbase(5_000_000_000, LockupScript::P2pkh(h(1)));
        assert!(tx.is_coinbase());
        assert_eq!(tx.total_output(), 5_000_000_000);
        assert_eq!(tx.hash(), tx.hash());
    }

    #[test]
    fn test_block_coinbase_is_last() {
        let user = Transaction {
            unsigned: UnsignedTx {
                inputs: vec![AssetOutputRef { tx_hash: h(9), index: 0 }],
                fixed_outputs: vec![TxOutput { amount: 10, lockup: LockupScript::P2pkh(h(2)) }],
                script: None,
            },
            signatures: Vec::new(),
            generated_outputs: Vec::new(),
        };
        let coinbase = Transaction::new_coinbase(100, LockupScript::P2pkh(h(1)));
        let txs = vec![user.clone(), coinbase.clone()];
        let block = Block {
            header: BlockHeader {
                deps: BlockDeps::empty(),
                txs_root: Block::compute_txs_root(&txs),
                timestamp_ms: 0,
                target: 0x20ffffff,
                nonce: 0,
            },
            transactions: txs,
        };
        assert_eq!(block.coinbase(), Some(&coinbase));
        assert_eq!(block.non_coinbase(), &[user]);
        assert!(block.validate_txs_root());
    }

    #[test]
    fn test_serialization_round_trip() {
        let tx = Transaction::new_coinbase(42, LockupScript::P2pkh(h(7)));
        let header = BlockHeader {
            deps: BlockDeps(vec![h(1), h(2), h(3)]),
            txs_root: h(4),
            timestamp_ms: 1234,
            target: 0x1d00ffff,
            nonce: 99,
        };
        let block = Block { header: header.clone(), transactions: vec![tx.clone()] };

        let tx2: Transaction = bincode::deserialize(&bincode::serialize(&tx).unwrap()).unwrap();
        assert_eq!(tx, tx2);
        let header2: BlockHeader =
            bincode::deserialize(&bincode::serialize(&header).unwrap()).unwrap();
        assert_eq!(header, header2);
        let block2: Block = bincode::deserialize(&bincode::serialize(&block).unwrap()).unwrap();
        assert_eq!(block, block2);
    }
}
