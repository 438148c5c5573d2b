use std::collections::HashMap;
use std::path::Path;

use log::debug;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, TransactionalTree,
};
use sled::{Batch, Db, Transactional, Tree};
use thiserror::Error;

use super::block::Block;
use super::utxo::UtxoEntry;

/// Tree holding serialized blocks keyed by hash, plus the tip pointer
const BLOCKS_TREE: &str = "blocks";

/// Tree holding the unspent outputs index keyed by transaction ID
const CHAINSTATE_TREE: &str = "chainstate";

/// Reserved key in the blocks tree pointing at the current tip
const TIP_KEY: &[u8] = b"l";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Store unavailable: {0}")]
    Unavailable(#[source] sled::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Tip changed: expected {expected}, found {found}")]
    TipConflict { expected: String, found: String },
}

/// Durable store for blocks, the tip pointer and the UTXO index
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Tree for blocks and the tip pointer
    blocks: Tree,

    /// Tree for the UTXO index
    chainstate: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage").finish()
    }
}

impl BlockchainStorage {
    /// Opens or creates the store at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(StorageError::Unavailable)?;

        let blocks = db.open_tree(BLOCKS_TREE).map_err(StorageError::Unavailable)?;
        let chainstate = db.open_tree(CHAINSTATE_TREE).map_err(StorageError::Unavailable)?;

        Ok(Self {
            db,
            blocks,
            chainstate,
        })
    }

    /// Gets the hash of the current tip, if a chain exists
    pub fn tip(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blocks.get(TIP_KEY)?.map(|tip| tip.to_vec()))
    }

    /// Gets a block by its hash
    ///
    /// # Returns
    ///
    /// The block, `NotFound` if absent, or `MalformedRecord` if it cannot be decoded
    pub fn get_block(&self, hash: &[u8]) -> Result<Block, StorageError> {
        let value = self
            .blocks
            .get(hash)?
            .ok_or_else(|| StorageError::NotFound(format!("Block with hash {} not found", hex::encode(hash))))?;

        let block = Block::from_bytes(&value)
            .map_err(|e| StorageError::MalformedRecord(format!("block {}: {}", hex::encode(hash), e)))?;

        if block.hash != hash {
            return Err(StorageError::MalformedRecord(format!(
                "block stored under {} carries hash {}",
                hex::encode(hash),
                hex::encode(&block.hash)
            )));
        }

        Ok(block)
    }

    /// Writes a block, advances the tip and updates the UTXO index in one transaction
    ///
    /// # Arguments
    ///
    /// * `block` - The block to save
    /// * `expected_tip` - The tip the block was mined on; `None` for genesis
    ///
    /// # Returns
    ///
    /// `TipConflict` without writing anything if the stored tip is not `expected_tip`
    pub fn commit_block(&self, block: &Block, expected_tip: Option<&[u8]>) -> Result<(), StorageError> {
        let value = block
            .to_bytes()
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let result = (&self.blocks, &self.chainstate).transaction(
            |(blocks, chainstate)| -> ConflictableTransactionResult<(), StorageError> {
                let current = blocks.get(TIP_KEY)?;
                if current.as_deref() != expected_tip {
                    return Err(ConflictableTransactionError::Abort(StorageError::TipConflict {
                        expected: describe_hash(expected_tip),
                        found: describe_hash(current.as_deref()),
                    }));
                }

                blocks.insert(block.hash.as_slice(), value.as_slice())?;
                blocks.insert(TIP_KEY, block.hash.as_slice())?;
                apply_block_to_index(chainstate, block)?;

                Ok(())
            },
        );

        result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StorageError::DatabaseError(e),
        })?;

        debug!("Committed block {}", hex::encode(&block.hash));
        Ok(())
    }

    /// Gets every entry of the UTXO index
    pub fn utxo_entries(&self) -> Result<Vec<(Vec<u8>, Vec<UtxoEntry>)>, StorageError> {
        let mut entries = Vec::new();

        for result in self.chainstate.iter() {
            let (key, value) = result?;
            entries.push((key.to_vec(), decode_entries(&value)?));
        }

        Ok(entries)
    }

    /// Replaces the whole UTXO index in one batch
    pub fn replace_utxo_index(&self, utxo: &HashMap<Vec<u8>, Vec<UtxoEntry>>) -> Result<(), StorageError> {
        let mut batch = Batch::default();

        for key in self.chainstate.iter().keys() {
            batch.remove(key?);
        }

        for (txid, entries) in utxo {
            batch.insert(txid.as_slice(), encode_entries(entries)?);
        }

        self.chainstate.apply_batch(batch)?;
        Ok(())
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Removes the outputs claimed by `block` from the index and adds the ones it creates
fn apply_block_to_index(
    chainstate: &TransactionalTree,
    block: &Block,
) -> ConflictableTransactionResult<(), StorageError> {
    for transaction in &block.transactions {
        if !transaction.is_coinbase() {
            for input in &transaction.inputs {
                let Some(value) = chainstate.get(&input.txid)? else {
                    continue;
                };

                let mut entries = decode_entries(&value).map_err(ConflictableTransactionError::Abort)?;
                entries.retain(|entry| entry.vout != input.vout);

                if entries.is_empty() {
                    chainstate.remove(input.txid.as_slice())?;
                } else {
                    let value = encode_entries(&entries).map_err(ConflictableTransactionError::Abort)?;
                    chainstate.insert(input.txid.as_slice(), value)?;
                }
            }
        }

        let created = UtxoEntry::from_transaction(transaction);
        if !created.is_empty() {
            let value = encode_entries(&created).map_err(ConflictableTransactionError::Abort)?;
            chainstate.insert(transaction.id.as_slice(), value)?;
        }
    }

    Ok(())
}

fn encode_entries(entries: &[UtxoEntry]) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(entries).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode_entries(value: &[u8]) -> Result<Vec<UtxoEntry>, StorageError> {
    bincode::deserialize(value).map_err(|e| StorageError::MalformedRecord(format!("UTXO entry: {}", e)))
}

fn describe_hash(hash: Option<&[u8]>) -> String {
    match hash {
        Some(hash) => hex::encode(hash),
        None => "no tip".to_string(),
    }
}
