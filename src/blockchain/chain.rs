use std::sync::atomic::AtomicBool;
use std::sync::{Arc, PoisonError, RwLock};

use log::{info, warn};
use thiserror::Error;

use super::block::{Block, BlockError};
use super::pow::ProofOfWork;
use super::scanner::ChainState;
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{total_value, Transaction, TransactionError, SUBSIDY};
use super::utxo::UtxoEntry;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("No existing blockchain found. Create one first")]
    ChainNotFound,

    #[error("Blockchain already exists")]
    ChainAlreadyExists,

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Block error: {0}")]
    BlockError(#[from] BlockError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// Represents the blockchain
#[derive(Debug)]
pub struct Blockchain {
    /// Hash of the most recently committed block
    tip: RwLock<Vec<u8>>,

    /// Storage for blockchain data
    storage: Arc<BlockchainStorage>,

    /// Proof of work difficulty shared by every block of the chain
    target_bits: u32,
}

impl Blockchain {
    /// Creates a new chain whose genesis block rewards `address`
    ///
    /// # Arguments
    ///
    /// * `storage` - The store to write the chain into; must not hold a chain yet
    /// * `address` - The address receiving the genesis reward
    /// * `genesis_message` - Data stored in the genesis coinbase input
    /// * `target_bits` - The proof of work difficulty for the whole chain
    pub fn create(
        storage: Arc<BlockchainStorage>,
        address: &str,
        genesis_message: &str,
        target_bits: u32,
    ) -> Result<Self, BlockchainError> {
        if storage.tip()?.is_some() {
            return Err(BlockchainError::ChainAlreadyExists);
        }

        let coinbase = Transaction::new_coinbase(address, genesis_message)?;
        let genesis = Block::new_genesis(coinbase, target_bits)?;

        storage.commit_block(&genesis, None).map_err(|e| match e {
            StorageError::TipConflict { .. } => BlockchainError::ChainAlreadyExists,
            e => e.into(),
        })?;
        storage.flush()?;

        info!("Created blockchain with genesis block {}", hex::encode(&genesis.hash));

        Ok(Blockchain {
            tip: RwLock::new(genesis.hash),
            storage,
            target_bits,
        })
    }

    /// Loads the chain held by `storage`
    ///
    /// The difficulty is taken from the stored tip, so every appended block
    /// keeps the difficulty the chain was created with.
    pub fn load(storage: Arc<BlockchainStorage>) -> Result<Self, BlockchainError> {
        let tip = storage.tip()?.ok_or(BlockchainError::ChainNotFound)?;
        let target_bits = storage.get_block(&tip)?.target_bits;

        info!("Loaded blockchain at tip {}", hex::encode(&tip));

        Ok(Blockchain {
            tip: RwLock::new(tip),
            storage,
            target_bits,
        })
    }

    /// Gets the hash of the current tip
    pub fn tip_hash(&self) -> Vec<u8> {
        self.tip.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn target_bits(&self) -> u32 {
        self.target_bits
    }

    pub(crate) fn storage(&self) -> &BlockchainStorage {
        &self.storage
    }

    /// Mines a block holding `transactions` on top of the tip and commits it
    pub fn append(&self, transactions: Vec<Transaction>) -> Result<Block, BlockchainError> {
        self.append_cancellable(transactions, &AtomicBool::new(false))
    }

    /// Same as [`Blockchain::append`], but the nonce search stops once `cancel` is set
    ///
    /// # Returns
    ///
    /// The committed block. Nothing is written when validation fails or mining is cancelled.
    pub fn append_cancellable(
        &self,
        transactions: Vec<Transaction>,
        cancel: &AtomicBool,
    ) -> Result<Block, BlockchainError> {
        self.append_at(self.tip_hash(), transactions, cancel)
    }

    /// Validates, mines and commits on top of `tip`; the commit fails if `tip` is no longer current
    fn append_at(
        &self,
        tip: Vec<u8>,
        transactions: Vec<Transaction>,
        cancel: &AtomicBool,
    ) -> Result<Block, BlockchainError> {
        self.verify_transactions(&tip, &transactions)?;

        let block = Block::mine(transactions, tip.clone(), self.target_bits, cancel).map_err(|e| {
            if let BlockError::MiningCancelled = e {
                warn!("Mining on top of {} cancelled", hex::encode(&tip));
            }
            e
        })?;

        self.storage.commit_block(&block, Some(tip.as_slice()))?;
        self.storage.flush()?;

        *self.tip.write().unwrap_or_else(PoisonError::into_inner) = block.hash.clone();

        info!(
            "Appended block {} with {} transactions (nonce {})",
            hex::encode(&block.hash),
            block.transactions.len(),
            block.nonce
        );

        Ok(block)
    }

    /// Checks `transactions` against the chain ending at `tip`
    ///
    /// A coinbase must mint exactly [`SUBSIDY`] in one output. Any other
    /// transaction must claim unspent outputs of the signing address and
    /// create no more value than it claims. IDs must be new to the chain
    /// and to the batch.
    fn verify_transactions(&self, tip: &[u8], transactions: &[Transaction]) -> Result<(), BlockchainError> {
        let ChainState {
            mut utxo,
            mut transaction_ids,
        } = self.chain_state_at(tip.to_vec())?;

        for transaction in transactions {
            let id = hex::encode(&transaction.id);

            if !transaction.has_valid_id()? {
                return Err(invalid(format!("transaction {} does not match its ID", id)));
            }

            if !transaction_ids.insert(transaction.id.clone()) {
                return Err(invalid(format!("transaction {} is already on the chain", id)));
            }

            if transaction.is_coinbase() {
                let mints_subsidy = matches!(transaction.outputs.as_slice(), [output] if output.value == SUBSIDY);
                if !mints_subsidy {
                    return Err(invalid(format!("coinbase {} must mint exactly {}", id, SUBSIDY)));
                }
            } else {
                if transaction.inputs.is_empty() {
                    return Err(invalid(format!("transaction {} has no inputs", id)));
                }

                let mut claimed = 0u64;
                for input in &transaction.inputs {
                    let claim = format!("{}:{}", hex::encode(&input.txid), input.vout);

                    let unknown = || invalid(format!("output {} is unknown or spent", claim));

                    let entries = utxo.get_mut(&input.txid).ok_or_else(unknown)?;
                    let position = entries
                        .iter()
                        .position(|entry| entry.vout == input.vout)
                        .ok_or_else(unknown)?;

                    if !entries[position].output.can_be_unlocked_with(&input.script_sig) {
                        return Err(invalid(format!("output {} is not owned by {}", claim, input.script_sig)));
                    }

                    let entry = entries.remove(position);
                    claimed = total_value([claimed, entry.output.value])?;
                }

                let created = total_value(transaction.outputs.iter().map(|output| output.value))
                    .map_err(|_| invalid(format!("outputs of transaction {} overflow", id)))?;
                if created > claimed {
                    return Err(invalid(format!(
                        "transaction {} creates {} from inputs worth {}",
                        id, created, claimed
                    )));
                }
            }

            // Later transactions in the batch may spend these outputs
            utxo.insert(transaction.id.clone(), UtxoEntry::from_transaction(transaction));
        }

        Ok(())
    }

    /// Returns a cursor walking from the current tip back to genesis
    pub fn iter(&self) -> BlockchainIterator {
        self.iter_from(self.tip_hash())
    }

    pub(crate) fn iter_from(&self, tip: Vec<u8>) -> BlockchainIterator {
        BlockchainIterator {
            current_hash: tip,
            storage: Arc::clone(&self.storage),
        }
    }

    /// Checks proof of work, transaction IDs and hash links of every block
    pub fn is_valid(&self) -> Result<bool, BlockchainError> {
        let mut expected_hash = self.tip_hash();

        for block in self.iter() {
            let block = block?;

            if block.hash != expected_hash {
                warn!("Block {} is not linked from its successor", hex::encode(&block.hash));
                return Ok(false);
            }

            if !ProofOfWork::new(&block).validate() {
                warn!("Block {} fails proof of work", hex::encode(&block.hash));
                return Ok(false);
            }

            for transaction in &block.transactions {
                if !transaction.has_valid_id()? {
                    warn!("Transaction {} does not match its ID", hex::encode(&transaction.id));
                    return Ok(false);
                }
            }

            expected_hash = block.prev_block_hash;
        }

        Ok(expected_hash.is_empty())
    }
}

fn invalid(reason: String) -> BlockchainError {
    BlockchainError::InvalidTransaction(reason)
}

/// Backward cursor over the blocks of a chain, from a fixed tip to genesis
pub struct BlockchainIterator {
    current_hash: Vec<u8>,
    storage: Arc<BlockchainStorage>,
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block, BlockchainError>;

    /// Yields the block at the cursor and moves to its predecessor.
    ///
    /// Returns `None` once the genesis block has been yielded. A read
    /// failure is yielded once and ends the walk.
    fn next(&mut self) -> Option<Self::Item> {
        if self.current_hash.is_empty() {
            return None;
        }

        match self.storage.get_block(&self.current_hash) {
            Ok(block) => {
                self.current_hash = block.prev_block_hash.clone();
                Some(Ok(block))
            }
            Err(e) => {
                self.current_hash.clear();
                Some(Err(e.into()))
            }
        }
    }
}
