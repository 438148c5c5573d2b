use std::sync::atomic::AtomicBool;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::pow::ProofOfWork;
use super::transaction::Transaction;

/// Errors that can occur while building or decoding blocks
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Mining cancelled")]
    MiningCancelled,

    #[error("Nonce space exhausted without meeting the target")]
    NonceExhausted,
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Unix timestamp (seconds) when mining started
    pub timestamp: i64,

    /// Transactions included in this block, in order
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block; empty for the genesis block
    pub prev_block_hash: Vec<u8>,

    /// Hash of this block, produced by the proof of work
    pub hash: Vec<u8>,

    /// Proof of work solution
    pub nonce: u64,

    /// Number of leading zero bits the hash must have
    pub target_bits: u32,
}

impl Block {
    /// Creates and mines a block on top of `prev_block_hash`
    pub fn new(
        transactions: Vec<Transaction>,
        prev_block_hash: Vec<u8>,
        target_bits: u32,
    ) -> Result<Self, BlockError> {
        Self::mine(transactions, prev_block_hash, target_bits, &AtomicBool::new(false))
    }

    /// Creates and mines the first block of a chain
    pub fn new_genesis(coinbase: Transaction, target_bits: u32) -> Result<Self, BlockError> {
        Self::new(vec![coinbase], Vec::new(), target_bits)
    }

    /// Creates a block and searches for its nonce, giving up once `cancel` is set
    ///
    /// # Arguments
    ///
    /// * `transactions` - The transactions to include in the block
    /// * `prev_block_hash` - The hash of the previous block
    /// * `target_bits` - The proof of work difficulty
    /// * `cancel` - Polled during the nonce search
    pub fn mine(
        transactions: Vec<Transaction>,
        prev_block_hash: Vec<u8>,
        target_bits: u32,
        cancel: &AtomicBool,
    ) -> Result<Self, BlockError> {
        let mut block = Block {
            timestamp: Utc::now().timestamp(),
            transactions,
            prev_block_hash,
            hash: Vec::new(),
            nonce: 0,
            target_bits,
        };

        let (nonce, hash) = ProofOfWork::new(&block).run(cancel)?;
        block.nonce = nonce;
        block.hash = hash;

        Ok(block)
    }

    /// Digest summarising the block's transactions
    pub fn hash_transactions(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for transaction in &self.transactions {
            hasher.update(&transaction.id);
        }

        hasher.finalize().to_vec()
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block_hash.is_empty()
    }

    /// Encodes the block with bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>, BlockError> {
        bincode::serialize(self).map_err(|e| BlockError::SerializationError(e.to_string()))
    }

    /// Decodes a block previously produced by [`Block::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockError> {
        bincode::deserialize(bytes).map_err(|e| BlockError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::{OutputRef, Spendable, SpendableOutputs, TransactionError};

    const BITS: u32 = 8;

    struct OneOutput;

    impl SpendableOutputs for OneOutput {
        type Error = TransactionError;

        fn find_spendable_outputs(&self, _address: &str, _amount: u64) -> Result<Spendable, Self::Error> {
            Ok(Spendable {
                accumulated: 10,
                outputs: vec![OutputRef {
                    txid: vec![7; 32],
                    vout: 0,
                    value: 10,
                }],
            })
        }
    }

    #[test]
    fn test_new_genesis_block() {
        let coinbase = Transaction::new_coinbase("Alice", "").unwrap();
        let block = Block::new_genesis(coinbase.clone(), BITS).unwrap();

        assert!(block.is_genesis());
        assert_eq!(block.transactions, vec![coinbase]);
        assert_eq!(block.hash.len(), 32);
        assert_eq!(block.target_bits, BITS);
    }

    #[test]
    fn test_new_block_links_previous() {
        let genesis = Block::new_genesis(Transaction::new_coinbase("Alice", "").unwrap(), BITS).unwrap();
        let block = Block::new(
            vec![Transaction::new_coinbase("Bob", "").unwrap()],
            genesis.hash.clone(),
            BITS,
        )
        .unwrap();

        assert!(!block.is_genesis());
        assert_eq!(block.prev_block_hash, genesis.hash);
        assert_ne!(block.hash, genesis.hash);
    }

    #[test]
    fn test_hash_transactions_is_order_sensitive() {
        let first = Transaction::new_coinbase("Alice", "").unwrap();
        let second = Transaction::new_coinbase("Bob", "").unwrap();

        let mut block = Block::new(vec![first.clone(), second.clone()], vec![1; 32], BITS).unwrap();
        let forward = block.hash_transactions();

        block.transactions = vec![second, first];
        assert_ne!(block.hash_transactions(), forward);
    }

    #[test]
    fn test_bytes_round_trip() {
        let genesis = Block::new_genesis(Transaction::new_coinbase("Alice", "").unwrap(), BITS).unwrap();
        assert_eq!(Block::from_bytes(&genesis.to_bytes().unwrap()).unwrap(), genesis);

        let spend = Transaction::new_utxo("Alice", "Bob", 4, &OneOutput).unwrap();
        let block = Block::new(vec![spend], genesis.hash.clone(), BITS).unwrap();
        assert_eq!(Block::from_bytes(&block.to_bytes().unwrap()).unwrap(), block);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        let result = Block::from_bytes(&[0xff, 0x01, 0x02]);
        assert!(matches!(result, Err(BlockError::DeserializationError(_))));
    }
}
