//! Error types for the transaction manager harness

use ethers::types::Address;
use thiserror::Error;

/// Main error type for the transaction manager components
#[derive(Error, Debug)]
pub enum TxmError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain connection error: {0}")]
    ChainConnection(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Cannot bump fee {original} any further: capped at {max}")]
    BumpExceedsLimit { original: String, max: String },

    #[error("Keystore error: {0}")]
    Keystore(String),

    #[error("No key found for address {0:?}")]
    KeyNotFound(Address),

    #[error("Address {0:?} is not tracked by the store")]
    AddressNotFound(Address),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("{service} has not been started")]
    NotStarted { service: &'static str },

    #[error("{service} has already been started")]
    AlreadyStarted { service: &'static str },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TxmError {
    /// Check if error is worth retrying on the next cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxmError::ChainConnection(_) | TxmError::GasEstimation(_) | TxmError::Transaction(_)
        )
    }
}

/// Result type for transaction manager operations
pub type TxmResult<T> = Result<T, TxmError>;
