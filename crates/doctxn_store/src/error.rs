//! Error types for store operations.

use crate::types::DurabilityLevel;
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document does not exist.
    #[error("document not found")]
    NotFound,

    /// A create found an existing document.
    #[error("document already exists")]
    AlreadyExists,

    /// The expected CAS no longer matches the document.
    #[error("CAS mismatch")]
    CasMismatch,

    /// A temporary condition (overload, rebalance); the call may be retried.
    #[error("temporary failure: {0}")]
    Temporary(String),

    /// The store cannot satisfy the requested durability.
    #[error("durability level {requested:?} cannot be satisfied")]
    DurabilityImpossible {
        /// The durability level that was requested.
        requested: DurabilityLevel,
    },

    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A snapshot file could not be encoded or decoded.
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl StoreError {
    /// Creates a temporary failure.
    pub fn temporary(message: impl Into<String>) -> Self {
        Self::Temporary(message.into())
    }

    /// Creates an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Returns true if the same call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Temporary(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(StoreError::temporary("rebalance").is_retryable());
        assert!(!StoreError::CasMismatch.is_retryable());
        assert!(!StoreError::unavailable("down").is_retryable());
        assert!(!StoreError::NotFound.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = StoreError::DurabilityImpossible {
            requested: DurabilityLevel::PersistToMajority,
        };
        assert!(err.to_string().contains("PersistToMajority"));
        assert_eq!(StoreError::NotFound.to_string(), "document not found");
    }
}
