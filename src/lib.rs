//! A minimal single-node ledger.
//!
//! An append-only, hash-linked chain of proof-of-work blocks stored in sled,
//! holding coinbase and value-transfer transactions. Balances and spendable
//! outputs are reconstructed by scanning the chain, with an optional
//! persistent UTXO index kept alongside the blocks.

pub mod blockchain;
pub mod cli;
pub mod config;
