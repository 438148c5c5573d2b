use log::info;
use serde::{Deserialize, Serialize};

use super::chain::{Blockchain, BlockchainError};
use super::transaction::{total_value, OutputRef, Spendable, SpendableOutputs, Transaction, TxOutput};

/// One unspent output as stored in the UTXO index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    /// Index of the output in its transaction
    pub vout: i64,

    /// The output itself
    pub output: TxOutput,
}

impl UtxoEntry {
    /// Entries for every output of `transaction`
    pub fn from_transaction(transaction: &Transaction) -> Vec<Self> {
        transaction
            .outputs
            .iter()
            .enumerate()
            .map(|(vout, output)| UtxoEntry {
                vout: vout as i64,
                output: output.clone(),
            })
            .collect()
    }
}

/// Persistent index of unspent outputs, kept next to the blocks
///
/// Every block commit updates the index in the same storage transaction;
/// `reindex` rebuilds it from a full chain scan.
pub struct UtxoSet<'a> {
    chain: &'a Blockchain,
}

impl<'a> UtxoSet<'a> {
    pub fn new(chain: &'a Blockchain) -> Self {
        UtxoSet { chain }
    }

    /// Rebuilds the index from the chain
    ///
    /// # Returns
    ///
    /// The number of transactions with unspent outputs
    pub fn reindex(&self) -> Result<usize, BlockchainError> {
        let utxo = self.chain.find_all_utxo()?;
        self.chain.storage().replace_utxo_index(&utxo)?;
        self.chain.storage().flush()?;

        info!("Rebuilt UTXO index with {} transactions", utxo.len());
        Ok(utxo.len())
    }

    /// Gets the unspent outputs owned by `address`
    pub fn find_utxo(&self, address: &str) -> Result<Vec<TxOutput>, BlockchainError> {
        let mut utxo = Vec::new();

        for (_, entries) in self.chain.storage().utxo_entries()? {
            for entry in entries {
                if entry.output.can_be_unlocked_with(address) {
                    utxo.push(entry.output);
                }
            }
        }

        Ok(utxo)
    }

    pub fn balance_of(&self, address: &str) -> Result<u64, BlockchainError> {
        let utxo = self.find_utxo(address)?;
        Ok(total_value(utxo.iter().map(|output| output.value))?)
    }

    /// Number of transactions in the index
    pub fn count_transactions(&self) -> Result<usize, BlockchainError> {
        Ok(self.chain.storage().utxo_entries()?.len())
    }
}

impl SpendableOutputs for UtxoSet<'_> {
    type Error = BlockchainError;

    fn find_spendable_outputs(&self, address: &str, amount: u64) -> Result<Spendable, Self::Error> {
        let mut spendable = Spendable::default();

        'index: for (txid, entries) in self.chain.storage().utxo_entries()? {
            for entry in entries {
                if spendable.accumulated >= amount {
                    break 'index;
                }

                if entry.output.can_be_unlocked_with(address) {
                    spendable.accumulated = total_value([spendable.accumulated, entry.output.value])?;
                    spendable.outputs.push(OutputRef {
                        txid: txid.clone(),
                        vout: entry.vout,
                        value: entry.output.value,
                    });
                }
            }
        }

        Ok(spendable)
    }
}
