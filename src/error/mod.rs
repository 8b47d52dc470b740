//! Error handling for the ledger
//!
//! One error type for every ledger operation. Precondition violations
//! (double initialisation, missing referenced transactions, empty Merkle
//! input) abort the enclosing operation through `Err`; expected negative
//! outcomes such as a failed signature check are returned as data instead.

use thiserror::Error;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// Storage backend failures
    #[error("Database error: {0}")]
    Database(String),
    /// Encoding/decoding of blocks, transactions and cache entries
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Cryptographic error: {0}")]
    Crypto(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Wallet error: {0}")]
    Wallet(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Ledger already initialized at the configured location")]
    AlreadyInitialized,
    #[error("No ledger found at the configured location, create one first")]
    NotInitialized,
    #[error("Cannot compute a Merkle root over an empty leaf list")]
    EmptyMerkleTree,
    #[error("Block must contain at least one transaction")]
    EmptyBlock,
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Difficulty {0} outside the supported range 1..=255")]
    InvalidDifficulty(u32),
    /// A referenced transaction could not be resolved (hex id)
    #[error("Referenced transaction not found: {0}")]
    MissingTransaction(String),
    #[error("Output index {index} does not exist in transaction {txid}")]
    InvalidOutputIndex { txid: String, index: i64 },
    #[error("Invalid transaction in batch: {0}")]
    InvalidTransaction(String),
    /// A transaction id already in the chain, or repeated in one batch
    #[error("Duplicate transaction id: {0}")]
    DuplicateTransaction(String),
    #[error("Invalid coinbase: {0}")]
    InvalidCoinbase(String),
    #[error("Double spend of output {txid}:{index}")]
    DoubleSpend { txid: String, index: i64 },
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },
    #[error("Unspent output {txid}:{index} missing from the UTXO index")]
    UtxoNotFound { txid: String, index: i64 },
    #[error("Nonce space exhausted before a valid proof was found")]
    NonceExhausted,
    #[error("Mining error: {0}")]
    Mining(String),
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::Io(err.to_string())
    }
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for LedgerError {
    fn from(err: bincode::error::EncodeError) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for LedgerError {
    fn from(err: bincode::error::DecodeError) -> Self {
        LedgerError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for LedgerError {
    fn from(err: toml::de::Error) -> Self {
        LedgerError::Config(err.to_string())
    }
}
