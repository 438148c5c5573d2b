use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Amount minted by every coinbase transaction
pub const SUBSIDY: u64 = 10;

/// Output index carried by the single input of a coinbase transaction
pub const COINBASE_VOUT: i64 = -1;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Value overflow while summing outputs")]
    ValueOverflow,
}

/// Sums output values, failing instead of wrapping
pub fn total_value<I>(values: I) -> Result<u64, TransactionError>
where
    I: IntoIterator<Item = u64>,
{
    values
        .into_iter()
        .try_fold(0u64, |total, value| total.checked_add(value))
        .ok_or(TransactionError::ValueOverflow)
}

/// A claim on one output of an earlier transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// ID of the transaction holding the claimed output (empty for coinbase)
    pub txid: Vec<u8>,

    /// Index of the claimed output in that transaction (-1 for coinbase)
    pub vout: i64,

    /// Unlock proof; the claiming address, or free text for coinbase
    pub script_sig: String,
}

impl TxInput {
    /// Whether this input was claimed by `address`
    pub fn can_unlock_output_with(&self, address: &str) -> bool {
        self.script_sig == address
    }
}

/// An amount locked to an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount carried by this output
    pub value: u64,

    /// Lock proof; the owning address
    pub script_pubkey: String,
}

impl TxOutput {
    pub fn new(value: u64, address: &str) -> Self {
        TxOutput {
            value,
            script_pubkey: address.to_string(),
        }
    }

    /// Whether the value in this output belongs to `address`
    pub fn can_be_unlocked_with(&self, address: &str) -> bool {
        self.script_pubkey == address
    }
}

/// Reference to a single unspent output selected for spending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    pub txid: Vec<u8>,
    pub vout: i64,
    pub value: u64,
}

/// Outputs chosen to fund a payment, with their summed value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Spendable {
    pub accumulated: u64,
    pub outputs: Vec<OutputRef>,
}

/// Source of spendable outputs for building value transfers
pub trait SpendableOutputs {
    type Error: From<TransactionError>;

    /// Selects outputs owned by `address` until their total reaches `amount`.
    ///
    /// A returned `accumulated` below `amount` means the address cannot
    /// fund the payment.
    fn find_spendable_outputs(&self, address: &str, amount: u64) -> Result<Spendable, Self::Error>;
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// SHA-256 of the transaction encoded with an empty ID
    pub id: Vec<u8>,

    /// Outputs claimed by this transaction
    pub inputs: Vec<TxInput>,

    /// Outputs created by this transaction
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Creates a coinbase transaction paying the subsidy to `to`
    ///
    /// # Arguments
    ///
    /// * `to` - The address receiving the reward
    /// * `data` - Free text stored in the input; defaults to "Reward to <to>"
    pub fn new_coinbase(to: &str, data: &str) -> Result<Self, TransactionError> {
        let data = if data.is_empty() {
            format!("Reward to {}", to)
        } else {
            data.to_string()
        };

        let input = TxInput {
            txid: Vec::new(),
            vout: COINBASE_VOUT,
            script_sig: data,
        };

        Self::with_id(vec![input], vec![TxOutput::new(SUBSIDY, to)])
    }

    /// Creates a transaction moving `amount` from `from` to `to`
    ///
    /// # Arguments
    ///
    /// * `from` - The paying address
    /// * `to` - The receiving address
    /// * `amount` - The amount to transfer
    /// * `provider` - Where the paying outputs are looked up
    ///
    /// # Returns
    ///
    /// The new transaction, or `InsufficientFunds` when `from` cannot cover `amount`
    pub fn new_utxo<P: SpendableOutputs>(
        from: &str,
        to: &str,
        amount: u64,
        provider: &P,
    ) -> Result<Self, P::Error> {
        if amount == 0 {
            return Err(TransactionError::InvalidAmount("Amount must be positive".to_string()).into());
        }

        let spendable = provider.find_spendable_outputs(from, amount)?;

        if spendable.accumulated < amount {
            return Err(TransactionError::InsufficientFunds {
                required: amount,
                available: spendable.accumulated,
            }
            .into());
        }

        let inputs = spendable
            .outputs
            .into_iter()
            .map(|output| TxInput {
                txid: output.txid,
                vout: output.vout,
                script_sig: from.to_string(),
            })
            .collect();

        let mut outputs = vec![TxOutput::new(amount, to)];
        if spendable.accumulated > amount {
            // Change back to the sender
            outputs.push(TxOutput::new(spendable.accumulated - amount, from));
        }

        Ok(Self::with_id(inputs, outputs)?)
    }

    fn with_id(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Result<Self, TransactionError> {
        let mut transaction = Transaction {
            id: Vec::new(),
            inputs,
            outputs,
        };

        transaction.id = transaction.hash()?;

        Ok(transaction)
    }

    /// Computes the content hash of the transaction, ignoring the current ID
    pub fn hash(&self) -> Result<Vec<u8>, TransactionError> {
        let copy = Transaction {
            id: Vec::new(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        };

        let mut hasher = Sha256::new();
        hasher.update(copy.to_bytes()?);

        Ok(hasher.finalize().to_vec())
    }

    /// Whether the stored ID matches the transaction content
    pub fn has_valid_id(&self) -> Result<bool, TransactionError> {
        Ok(self.hash()? == self.id)
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].txid.is_empty() && self.inputs[0].vout == COINBASE_VOUT
    }

    /// Encodes the transaction with bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransactionError> {
        bincode::serialize(self).map_err(|e| TransactionError::SerializationError(e.to_string()))
    }

    /// Decodes a transaction previously produced by [`Transaction::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransactionError> {
        bincode::deserialize(bytes).map_err(|e| TransactionError::SerializationError(e.to_string()))
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", hex::encode(&self.id))?;

        for (index, input) in self.inputs.iter().enumerate() {
            writeln!(f, "     Input {}:", index)?;
            writeln!(f, "       TXID:      {}", hex::encode(&input.txid))?;
            writeln!(f, "       Out:       {}", input.vout)?;
            writeln!(f, "       ScriptSig: {}", input.script_sig)?;
        }

        for (index, output) in self.outputs.iter().enumerate() {
            writeln!(f, "     Output {}:", index)?;
            writeln!(f, "       Value:  {}", output.value)?;
            writeln!(f, "       Script: {}", output.script_pubkey)?;
        }

        Ok(())
    }
}
