//! Balance and spendable-output queries answered by walking the whole chain.
//!
//! Blocks are visited tip to genesis and the transactions of each block last
//! to first, so every input is seen before the output it claims.

use std::collections::{HashMap, HashSet};

use super::chain::{Blockchain, BlockchainError};
use super::transaction::{total_value, OutputRef, Spendable, SpendableOutputs, Transaction, TxOutput};
use super::utxo::UtxoEntry;

/// Unspent outputs and known transaction IDs of the chain ending at one tip
pub(crate) struct ChainState {
    pub utxo: HashMap<Vec<u8>, Vec<UtxoEntry>>,
    pub transaction_ids: HashSet<Vec<u8>>,
}

/// A transaction together with the indexes of its outputs still unspent for one address
struct UnspentTransaction {
    transaction: Transaction,
    outputs: Vec<usize>,
}

impl Blockchain {
    /// Gets the transactions holding at least one unspent output owned by `address`
    ///
    /// Each transaction appears once, newest first.
    pub fn find_unspent_transactions(&self, address: &str) -> Result<Vec<Transaction>, BlockchainError> {
        Ok(self
            .scan_unspent(address)?
            .into_iter()
            .map(|unspent| unspent.transaction)
            .collect())
    }

    /// Gets the unspent outputs owned by `address`
    pub fn find_utxo(&self, address: &str) -> Result<Vec<TxOutput>, BlockchainError> {
        let mut utxo = Vec::new();

        for unspent in self.scan_unspent(address)? {
            for vout in unspent.outputs {
                utxo.push(unspent.transaction.outputs[vout].clone());
            }
        }

        Ok(utxo)
    }

    /// Sums the unspent outputs owned by `address`
    pub fn balance_of(&self, address: &str) -> Result<u64, BlockchainError> {
        let utxo = self.find_utxo(address)?;
        Ok(total_value(utxo.iter().map(|output| output.value))?)
    }

    /// Gets every unspent output on the chain, keyed by transaction ID
    pub fn find_all_utxo(&self) -> Result<HashMap<Vec<u8>, Vec<UtxoEntry>>, BlockchainError> {
        Ok(self.chain_state_at(self.tip_hash())?.utxo)
    }

    /// Walks the chain ending at `tip`, independently of later appends
    pub(crate) fn chain_state_at(&self, tip: Vec<u8>) -> Result<ChainState, BlockchainError> {
        let mut utxo: HashMap<Vec<u8>, Vec<UtxoEntry>> = HashMap::new();
        let mut transaction_ids = HashSet::new();
        let mut spent: HashMap<Vec<u8>, HashSet<i64>> = HashMap::new();

        for block in self.iter_from(tip) {
            let block = block?;

            for transaction in block.transactions.iter().rev() {
                transaction_ids.insert(transaction.id.clone());

                let claimed = spent.get(&transaction.id);
                let entries: Vec<UtxoEntry> = UtxoEntry::from_transaction(transaction)
                    .into_iter()
                    .filter(|entry| !claimed.is_some_and(|claimed| claimed.contains(&entry.vout)))
                    .collect();

                if !entries.is_empty() {
                    utxo.insert(transaction.id.clone(), entries);
                }

                if !transaction.is_coinbase() {
                    for input in &transaction.inputs {
                        spent.entry(input.txid.clone()).or_default().insert(input.vout);
                    }
                }
            }

            if block.is_genesis() {
                break;
            }
        }

        Ok(ChainState { utxo, transaction_ids })
    }

    fn scan_unspent(&self, address: &str) -> Result<Vec<UnspentTransaction>, BlockchainError> {
        let mut unspent = Vec::new();
        // Output indexes already claimed by inputs of `address`, keyed by transaction ID
        let mut spent: HashMap<Vec<u8>, HashSet<i64>> = HashMap::new();

        for block in self.iter() {
            let block = block?;

            for transaction in block.transactions.iter().rev() {
                let claimed = spent.get(&transaction.id);
                let outputs: Vec<usize> = transaction
                    .outputs
                    .iter()
                    .enumerate()
                    .filter(|(vout, output)| {
                        let is_spent = claimed.is_some_and(|claimed| claimed.contains(&(*vout as i64)));
                        !is_spent && output.can_be_unlocked_with(address)
                    })
                    .map(|(vout, _)| vout)
                    .collect();

                if !outputs.is_empty() {
                    unspent.push(UnspentTransaction {
                        transaction: transaction.clone(),
                        outputs,
                    });
                }

                // Only after this transaction's own outputs were checked
                if !transaction.is_coinbase() {
                    for input in &transaction.inputs {
                        if input.can_unlock_output_with(address) {
                            spent.entry(input.txid.clone()).or_default().insert(input.vout);
                        }
                    }
                }
            }

            if block.is_genesis() {
                break;
            }
        }

        Ok(unspent)
    }
}

impl SpendableOutputs for Blockchain {
    type Error = BlockchainError;

    /// Greedily collects unspent outputs of `address`, newest first, until `amount` is covered
    fn find_spendable_outputs(&self, address: &str, amount: u64) -> Result<Spendable, Self::Error> {
        let mut spendable = Spendable::default();

        'scan: for unspent in self.scan_unspent(address)? {
            for vout in unspent.outputs {
                if spendable.accumulated >= amount {
                    break 'scan;
                }

                let value = unspent.transaction.outputs[vout].value;
                spendable.accumulated = total_value([spendable.accumulated, value])?;
                spendable.outputs.push(OutputRef {
                    txid: unspent.transaction.id.clone(),
                    vout: vout as i64,
                    value,
                });
            }
        }

        Ok(spendable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::Block;
    use crate::blockchain::storage::BlockchainStorage;
    use crate::blockchain::transaction::{TransactionError, SUBSIDY};
    use crate::blockchain::utxo::UtxoSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    const BITS: u32 = 8;

    fn new_chain(dir: &TempDir, address: &str) -> Blockchain {
        let storage = Arc::new(BlockchainStorage::open(dir.path()).unwrap());
        Blockchain::create(storage, address, "", BITS).unwrap()
    }

    fn send(chain: &Blockchain, from: &str, to: &str, amount: u64) {
        let transaction = Transaction::new_utxo(from, to, amount, chain).unwrap();
        chain.append(vec![transaction]).unwrap();
    }

    #[test]
    fn test_genesis_balance() {
        let dir = TempDir::new().unwrap();
        let chain = new_chain(&dir, "Alice");

        assert_eq!(chain.balance_of("Alice").unwrap(), 10);
        assert_eq!(chain.balance_of("Bob").unwrap(), 0);
    }

    #[test]
    fn test_send_moves_funds() {
        let dir = TempDir::new().unwrap();
        let chain = new_chain(&dir, "Alice");

        send(&chain, "Alice", "Bob", 3);

        assert_eq!(chain.balance_of("Alice").unwrap(), 7);
        assert_eq!(chain.balance_of("Bob").unwrap(), 3);
        assert_eq!(chain.iter().count(), 2);
    }

    #[test]
    fn test_spent_coinbase_leaves_unspent_set() {
        let dir = TempDir::new().unwrap();
        let chain = new_chain(&dir, "Alice");
        let coinbase_id = chain.find_unspent_transactions("Alice").unwrap()[0].id.clone();

        send(&chain, "Alice", "Bob", 4);

        assert_eq!(chain.balance_of("Alice").unwrap(), 6);
        assert_eq!(chain.balance_of("Bob").unwrap(), 4);

        let unspent = chain.find_unspent_transactions("Alice").unwrap();
        assert_eq!(unspent.len(), 1);
        assert!(unspent.iter().all(|transaction| transaction.id != coinbase_id));
        assert_eq!(chain.find_utxo("Alice").unwrap(), vec![TxOutput::new(6, "Alice")]);
    }

    #[test]
    fn test_coinbase_conservation() {
        let dir = TempDir::new().unwrap();
        let chain = new_chain(&dir, "Alice");

        for (height, address) in ["Bob", "Alice", "Bob"].iter().enumerate() {
            let note = format!("reward at height {}", height + 1);
            chain.append(vec![Transaction::new_coinbase(address, &note).unwrap()]).unwrap();
        }

        let total = chain.balance_of("Alice").unwrap() + chain.balance_of("Bob").unwrap();
        assert_eq!(total, SUBSIDY * 4);
        assert_eq!(chain.balance_of("Alice").unwrap(), 20);
    }

    #[test]
    fn test_spendable_outputs_stop_early() {
        let dir = TempDir::new().unwrap();
        let chain = new_chain(&dir, "Alice");
        chain.append(vec![Transaction::new_coinbase("Alice", "second").unwrap()]).unwrap();
        chain.append(vec![Transaction::new_coinbase("Alice", "third").unwrap()]).unwrap();

        let spendable = chain.find_spendable_outputs("Alice", 15).unwrap();
        assert_eq!(spendable.accumulated, 20);
        assert_eq!(spendable.outputs.len(), 2);

        let spendable = chain.find_spendable_outputs("Alice", 10).unwrap();
        assert_eq!(spendable.accumulated, 10);
        assert_eq!(spendable.outputs.len(), 1);

        let spendable = chain.find_spendable_outputs("Alice", 100).unwrap();
        assert_eq!(spendable.accumulated, 30);
        assert_eq!(spendable.outputs.len(), 3);
    }

    #[test]
    fn test_payment_over_several_outputs() {
        let dir = TempDir::new().unwrap();
        let chain = new_chain(&dir, "Alice");
        chain.append(vec![Transaction::new_coinbase("Alice", "second").unwrap()]).unwrap();

        send(&chain, "Alice", "Bob", 15);
        send(&chain, "Bob", "Carol", 5);

        assert_eq!(chain.balance_of("Alice").unwrap(), 5);
        assert_eq!(chain.balance_of("Bob").unwrap(), 10);
        assert_eq!(chain.balance_of("Carol").unwrap(), 5);
    }

    #[test]
    fn test_find_all_utxo() {
        let dir = TempDir::new().unwrap();
        let chain = new_chain(&dir, "Alice");
        send(&chain, "Alice", "Bob", 4);

        let utxo = chain.find_all_utxo().unwrap();
        let mut outputs: Vec<TxOutput> = utxo
            .values()
            .flatten()
            .map(|entry| entry.output.clone())
            .collect();
        outputs.sort_by_key(|output| output.value);

        assert_eq!(utxo.len(), 1);
        assert_eq!(outputs, vec![TxOutput::new(4, "Bob"), TxOutput::new(6, "Alice")]);
    }

    #[test]
    fn test_balance_overflow_is_an_error() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(BlockchainStorage::open(dir.path()).unwrap());
        let genesis_tip = Blockchain::create(Arc::clone(&storage), "Alice", "", BITS)
            .unwrap()
            .tip_hash();

        // Committed straight to the store, append would refuse it
        let mut minted = Transaction {
            id: Vec::new(),
            inputs: Vec::new(),
            outputs: vec![TxOutput::new(u64::MAX, "Alice")],
        };
        minted.id = minted.hash().unwrap();
        let block = Block::new(vec![minted], genesis_tip.clone(), BITS).unwrap();
        storage.commit_block(&block, Some(genesis_tip.as_slice())).unwrap();

        let chain = Blockchain::load(storage).unwrap();
        assert!(matches!(
            chain.balance_of("Alice"),
            Err(BlockchainError::TransactionError(TransactionError::ValueOverflow))
        ));
        assert!(matches!(
            UtxoSet::new(&chain).balance_of("Alice"),
            Err(BlockchainError::TransactionError(TransactionError::ValueOverflow))
        ));
        assert_eq!(chain.find_utxo("Alice").unwrap().len(), 2);
    }
}
