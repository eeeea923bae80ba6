//! Error handling for the replication engine
//!
//! Missing blocks, transactions and accounts are not errors: lookups return
//! `Option` and the engine turns a miss into a remote request. The variants
//! below are reserved for genuine failures (storage, encoding, crypto, I/O).

use std::fmt;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, ChainError>;

/// Error types for chain replication operations
#[derive(Debug, Clone)]
pub enum ChainError {
    /// Database-related errors
    Database(String),
    /// Cryptographic operation errors
    Crypto(String),
    /// DHT transport errors
    Network(String),
    /// Transaction validation errors
    Transaction(String),
    /// Configuration errors
    Config(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// File I/O errors
    Io(String),
    /// Block construction or validation errors
    InvalidBlock(String),
    /// The chain is not followed by this node
    UnknownChain(String),
    /// The chain's worker has stopped and can no longer answer
    ChainStopped(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Database(msg) => write!(f, "Database error: {msg}"),
            ChainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            ChainError::Network(msg) => write!(f, "Network error: {msg}"),
            ChainError::Transaction(msg) => write!(f, "Transaction error: {msg}"),
            ChainError::Config(msg) => write!(f, "Configuration error: {msg}"),
            ChainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            ChainError::Io(msg) => write!(f, "I/O error: {msg}"),
            ChainError::InvalidBlock(msg) => write!(f, "Invalid block: {msg}"),
            ChainError::UnknownChain(chain) => write!(f, "Chain is not followed: {chain}"),
            ChainError::ChainStopped(chain) => write!(f, "Chain worker stopped: {chain}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::Io(err.to_string())
    }
}

impl From<sled::Error> for ChainError {
    fn from(err: sled::Error) -> Self {
        ChainError::Database(err.to_string())
    }
}

impl From<sled::transaction::TransactionError<ChainError>> for ChainError {
    fn from(err: sled::transaction::TransactionError<ChainError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(e) => ChainError::Database(e.to_string()),
        }
    }
}

impl From<bincode::error::EncodeError> for ChainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for ChainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        ChainError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::Config(err.to_string())
    }
}
