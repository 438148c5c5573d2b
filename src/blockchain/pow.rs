use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use sha2::{Digest, Sha256};

use super::block::{Block, BlockError};

/// How many nonces are tried between checks of the cancel flag
const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Hashcash-style puzzle over a block's header fields
pub struct ProofOfWork<'a> {
    block: &'a Block,
}

impl<'a> ProofOfWork<'a> {
    pub fn new(block: &'a Block) -> Self {
        ProofOfWork { block }
    }

    /// Puzzle input for `nonce`: prev hash, transactions digest, timestamp, target bits, nonce
    fn prepare_data(&self, transactions_hash: &[u8], nonce: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.block.prev_block_hash.len() + transactions_hash.len() + 24);
        data.extend_from_slice(&self.block.prev_block_hash);
        data.extend_from_slice(transactions_hash);
        data.extend_from_slice(&self.block.timestamp.to_be_bytes());
        data.extend_from_slice(&i64::from(self.block.target_bits).to_be_bytes());
        data.extend_from_slice(&nonce.to_be_bytes());
        data
    }

    /// Searches nonces from zero until the hash falls below the target
    ///
    /// # Returns
    ///
    /// The winning nonce and the block hash it produces
    pub fn run(&self, cancel: &AtomicBool) -> Result<(u64, Vec<u8>), BlockError> {
        let transactions_hash = self.block.hash_transactions();
        let mut nonce: u64 = 0;

        loop {
            if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                return Err(BlockError::MiningCancelled);
            }

            let hash = Sha256::digest(self.prepare_data(&transactions_hash, nonce)).to_vec();
            if meets_target(&hash, self.block.target_bits) {
                debug!("Found nonce {} for hash {}", nonce, hex::encode(&hash));
                return Ok((nonce, hash));
            }

            nonce = nonce.checked_add(1).ok_or(BlockError::NonceExhausted)?;
        }
    }

    /// Checks that the stored nonce reproduces the stored hash and meets the target
    pub fn validate(&self) -> bool {
        let data = self.prepare_data(&self.block.hash_transactions(), self.block.nonce);
        let hash = Sha256::digest(data);

        hash.as_slice() == self.block.hash.as_slice() && meets_target(&hash, self.block.target_bits)
    }
}

/// Whether a 256-bit big-endian `hash` is strictly below 2^(256 - target_bits)
pub fn meets_target(hash: &[u8], target_bits: u32) -> bool {
    if hash.len() != 32 {
        return false;
    }

    let mut zeros = 0;
    for byte in hash {
        zeros += byte.leading_zeros();
        if *byte != 0 {
            break;
        }
    }

    zeros >= target_bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::Transaction;

    fn mined_block(bits: u32) -> Block {
        Block::new_genesis(Transaction::new_coinbase("Alice", "").unwrap(), bits).unwrap()
    }

    #[test]
    fn test_meets_target() {
        let mut hash = [0xffu8; 32];
        assert!(meets_target(&hash, 0));
        assert!(!meets_target(&hash, 1));

        hash[0] = 0x00;
        hash[1] = 0x0f;
        assert!(meets_target(&hash, 12));
        assert!(!meets_target(&hash, 13));

        assert!(meets_target(&[0u8; 32], 256));
        assert!(!meets_target(&[0u8; 16], 0));
    }

    #[test]
    fn test_mined_block_validates() {
        let block = mined_block(10);
        assert!(ProofOfWork::new(&block).validate());
        assert!(meets_target(&block.hash, 10));
    }

    #[test]
    fn test_validate_is_idempotent() {
        let block = mined_block(8);
        let before = block.clone();

        let pow = ProofOfWork::new(&block);
        let first = pow.validate();
        let second = pow.validate();

        assert!(first);
        assert_eq!(first, second);
        assert_eq!(block, before);
    }

    #[test]
    fn test_tampered_block_fails_validation() {
        let block = mined_block(8);

        let mut wrong_nonce = block.clone();
        wrong_nonce.nonce = wrong_nonce.nonce.wrapping_add(1);
        assert!(!ProofOfWork::new(&wrong_nonce).validate());

        let mut wrong_transactions = block.clone();
        wrong_transactions.transactions = vec![Transaction::new_coinbase("Mallory", "").unwrap()];
        assert!(!ProofOfWork::new(&wrong_transactions).validate());

        let mut wrong_prev = block.clone();
        wrong_prev.prev_block_hash = vec![1; 32];
        assert!(!ProofOfWork::new(&wrong_prev).validate());

        let mut easier = block;
        easier.target_bits = 0;
        assert!(!ProofOfWork::new(&easier).validate());
    }

    #[test]
    fn test_run_stops_when_cancelled() {
        let cancel = AtomicBool::new(true);
        let result = Block::mine(
            vec![Transaction::new_coinbase("Alice", "").unwrap()],
            Vec::new(),
            64,
            &cancel,
        );

        assert!(matches!(result, Err(BlockError::MiningCancelled)));
    }
}
