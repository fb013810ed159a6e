//! Error types for the credit ledger

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// No caller identity was supplied
    #[error("Authentication required")]
    Unauthenticated,

    /// Malformed, missing or self-referencing request argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Account or product missing
    #[error("{0} not found")]
    NotFound(String),

    /// Entity exists but is not in a state that allows the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Balance read inside the transaction does not cover the debit
    #[error("Insufficient credits: balance {available}, required {required}")]
    InsufficientFunds {
        /// Balance at transaction time
        available: u64,
        /// Amount the operation needed
        required: u64,
    },

    /// The account already registered a referral code
    #[error("User already used a referral code")]
    AlreadyReferred,

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Transaction kept conflicting, or a worker channel closed
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Arithmetic on a counter left its range
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-facing error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No caller identity
    Unauthenticated,
    /// Bad request argument
    InvalidArgument,
    /// Missing account or product
    NotFound,
    /// Product not purchasable
    InvalidState,
    /// Balance too low
    InsufficientFunds,
    /// Referral already registered
    AlreadyReferred,
    /// Store-level or other internal failure
    Internal,
}

impl ErrorKind {
    /// Stable string code
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::AlreadyReferred => "already_referred",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Error {
    /// Collapse into the caller-facing taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unauthenticated => ErrorKind::Unauthenticated,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Error::AlreadyReferred => ErrorKind::AlreadyReferred,
            Error::Storage(_)
            | Error::Serialization(_)
            | Error::Concurrency(_)
            | Error::InvariantViolation(_)
            | Error::Config(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the error is a store conflict the transaction loop may retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Concurrency(_))
    }

    /// Whether a later attempt at the same operation could succeed
    ///
    /// Everything else fails identically on every rerun.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Concurrency(_) | Error::Storage(_) | Error::Io(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        match err.kind() {
            rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TryAgain => {
                Error::Concurrency(err.to_string())
            }
            _ => Error::Storage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_variants_collapse() {
        assert_eq!(Error::Storage("disk".into()).kind(), ErrorKind::Internal);
        assert_eq!(Error::Concurrency("busy".into()).kind(), ErrorKind::Internal);
        assert_eq!(
            Error::InsufficientFunds { available: 10, required: 30 }.kind(),
            ErrorKind::InsufficientFunds
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(Error::Concurrency("busy".into()).is_transient());
        assert!(Error::Storage("disk".into()).is_transient());
        assert!(!Error::Storage("disk".into()).is_retryable());
        assert!(!Error::InvariantViolation("overflow".into()).is_transient());
        assert!(!Error::InvalidArgument("id".into()).is_transient());
    }

    #[test]
    fn test_messages_are_user_visible() {
        let err = Error::InsufficientFunds { available: 10, required: 30 };
        assert_eq!(err.to_string(), "Insufficient credits: balance 10, required 30");
        assert_eq!(Error::NotFound("Product p1".into()).to_string(), "Product p1 not found");
        assert_eq!(ErrorKind::AlreadyReferred.code(), "already_referred");
    }
}
