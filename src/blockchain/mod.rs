// Blockchain module
//
// This module contains the ledger implementation including:
// - Transaction structure
// - Block structure and proof of work
// - Persistent storage
// - Blockchain structure
// - UTXO scanning and the UTXO index

pub mod block;
pub mod chain;
pub mod pow;
pub mod scanner;
pub mod storage;
pub mod transaction;
pub mod utxo;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Blockchain, BlockchainError, BlockchainIterator};
pub use pow::ProofOfWork;
pub use storage::BlockchainStorage;
pub use transaction::{SpendableOutputs, Transaction};
pub use utxo::UtxoSet;
