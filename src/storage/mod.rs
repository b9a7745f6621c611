//! Persistent storage backend using the sled embedded database.
//!
//! Each logical column family is a named sled tree:
//!   block-bodies  BlockHash -> Block
//!   headers       BlockHash -> BlockHeader
//!   block-state   BlockHash -> (height, weight, state root)
//!   trie          state root -> world-state snapshot
//!   node-state    chain-state per ChainIndex, is-initialized flag,
//!                 BlockHash -> state-root shortcuts
//!
//! Multi-key invariants within a tree go through `sled::Batch` so a crash
//! cannot persist half of a block commit.

use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};
use std::path::Path;

use crate::core::types::*;

const KEY_INITIALIZED: &[u8] = b"is-initialized";
const PREFIX_CHAIN_STATE: &[u8] = b"chain-state:";
const PREFIX_TRIE_HASH: &[u8] = b"trie-hash:";

/// Height, cumulative weight, and world-state root of an accepted block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockStateRecord {
    pub height: u64,
    pub weight: u128,
    pub world_state_root: Hash256,
}

/// Persisted tip set and best tip of one chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainStateRecord {
    pub tips: Vec<Hash256>,
    pub best_tip: Hash256,
}

pub struct Stores {
    db: Db,
    block_bodies: Tree,
    headers: Tree,
    block_state: Tree,
    trie: Tree,
    node_state: Tree,
}

impl Stores {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(db_err)?;
        Self::with_db(db)
    }

    /// In-memory database for tests and throwaway nodes
    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open().map_err(db_err)?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self, StorageError> {
        Ok(Stores {
            block_bodies: db.open_tree("block-bodies").map_err(db_err)?,
            headers: db.open_tree("headers").map_err(db_err)?,
            block_state: db.open_tree("block-state").map_err(db_err)?,
            trie: db.open_tree("trie").map_err(db_err)?,
            node_state: db.open_tree("node-state").map_err(db_err)?,
            db,
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.node_state.contains_key(KEY_INITIALIZED).unwrap_or(false)
    }

    pub fn mark_initialized(&self) -> Result<(), StorageError> {
        self.node_state.insert(KEY_INITIALIZED, &[1u8]).map_err(db_err)?;
        Ok(())
    }

    // ─── Blocks and Headers ─────────────────────────────────────────

    /// Commit a freshly accepted block: body, header, and state record in
    /// one logical write. Bodies and headers live in separate trees; the
    /// state record is written last and acts as the commit marker on
    /// reload, so a torn write leaves at worst an unreferenced body.
    pub fn put_block_commit(
        &self,
        hash: &Hash256,
        block: &Block,
        state: &BlockStateRecord,
    ) -> Result<(), StorageError> {
        self.block_bodies.insert(hash, encode(block)?).map_err(db_err)?;
        self.headers.insert(hash, encode(&block.header)?).map_err(db_err)?;
        self.block_state.insert(hash, encode(state)?).map_err(db_err)?;
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, StorageError> {
        self.block_bodies.get(hash).map_err(db_err)?.map(|b| decode(&b)).transpose()
    }

    pub fn get_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, StorageError> {
        self.headers.get(hash).map_err(db_err)?.map(|b| decode(&b)).transpose()
    }

    pub fn get_block_state(&self, hash: &Hash256) -> Result<Option<BlockStateRecord>, StorageError> {
        self.block_state.get(hash).map_err(db_err)?.map(|b| decode(&b)).transpose()
    }

    /// Iterate every persisted block-state entry (startup reload)
    pub fn scan_block_states(
        &self,
    ) -> impl Iterator<Item = Result<(Hash256, BlockStateRecord), StorageError>> + '_ {
        self.block_state.iter().map(|item| {
            let (key, value) = item.map_err(db_err)?;
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key);
            Ok((hash, decode(&value)?))
        })
    }

    // ─── Trie (world-state snapshots, versioned by root) ────────────

    pub fn put_trie_snapshot(&self, root: &Hash256, bytes: &[u8]) -> Result<(), StorageError> {
        // Snapshots are immutable per root; re-inserting the same root is a no-op
        self.trie.insert(root, bytes).map_err(db_err)?;
        Ok(())
    }

    pub fn get_trie_snapshot(&self, root: &Hash256) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.trie.get(root).map_err(db_err)?.map(|v| v.to_vec()))
    }

    // ─── Node State ─────────────────────────────────────────────────

    pub fn put_chain_state(
        &self,
        chain_id: usize,
        record: &ChainStateRecord,
    ) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        batch.insert(chain_state_key(chain_id), encode(record)?);
        self.node_state.apply_batch(batch).map_err(db_err)?;
        Ok(())
    }

    pub fn get_chain_state(&self, chain_id: usize) -> Result<Option<ChainStateRecord>, StorageError> {
        self.node_state
            .get(chain_state_key(chain_id))
            .map_err(db_err)?
            .map(|b| decode(&b))
            .transpose()
    }

    pub fn put_trie_hash(&self, block: &Hash256, root: &Hash256) -> Result<(), StorageError> {
        self.node_state
            .insert(prefixed_key(PREFIX_TRIE_HASH, block), root.as_slice())
            .map_err(db_err)?;
        Ok(())
    }

    pub fn get_trie_hash(&self, block: &Hash256) -> Result<Option<Hash256>, StorageError> {
        match self.node_state.get(prefixed_key(PREFIX_TRIE_HASH, block)).map_err(db_err)? {
            Some(bytes) => {
                let mut root = [0u8; 32];
                root.copy_from_slice(&bytes);
                Ok(Some(root))
            }
            None => Ok(None),
        }
    }

    /// Flush all trees to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(db_err)?;
        Ok(())
    }

    /// Drain in-flight writes and release the database
    pub fn close(&self) -> Result<(), StorageError> {
        self.flush()
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

fn chain_state_key(chain_id: usize) -> Vec<u8> {
    prefixed_key(PREFIX_CHAIN_STATE, &(chain_id as u32).to_be_bytes())
}

fn prefixed_key(prefix: &[u8], data: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + data.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(data);
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializeError(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes).map_err(|e| StorageError::SerializeError(e.to_string()))
}

fn db_err(e: sled::Error) -> StorageError {
    StorageError::DbError(e.to_string())
}

#[derive(Debug)]
pub enum StorageError {
    DbError(String),
    SerializeError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::DbError(e) => write!(f, "database error: {}", e),
            StorageError::SerializeError(e) => write!(f, "serialization error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}
