//! Error types for doctxn core.

use crate::atr::AtrPhase;
use crate::transactions::TransactionResult;
use crate::types::AttemptId;
use doctxn_store::{CollectionRef, StoreError};
use thiserror::Error;

/// Result type for transactional operations.
pub type TxnResult<T> = Result<T, TxnError>;

/// Errors raised inside a transaction attempt.
///
/// The orchestrator classifies these into retryable, expired and fatal
/// outcomes; see [`TxnError::is_retryable`].
#[derive(Debug, Error)]
pub enum TxnError {
    /// The document changed since this attempt last saw it.
    #[error("CAS mismatch on {key} in {collection}")]
    CasMismatch {
        /// Collection of the document.
        collection: CollectionRef,
        /// Document key.
        key: String,
    },

    /// The document is staged by another live attempt.
    #[error("write-write conflict on {key} in {collection}: staged by attempt {blocking_attempt}")]
    WriteWriteConflict {
        /// Collection of the document.
        collection: CollectionRef,
        /// Document key.
        key: String,
        /// The attempt holding the document.
        blocking_attempt: AttemptId,
    },

    /// A temporary store condition.
    #[error("transient failure: {0}")]
    TransientFailure(String),

    /// The transaction deadline has passed.
    #[error("transaction expired")]
    Expired,

    /// The document does not exist.
    #[error("document {key} not found in {collection}")]
    DocumentNotFound {
        /// Collection of the document.
        collection: CollectionRef,
        /// Document key.
        key: String,
    },

    /// The document already exists.
    #[error("document {key} already exists in {collection}")]
    DocumentExists {
        /// Collection of the document.
        collection: CollectionRef,
        /// Document key.
        key: String,
    },

    /// Staging metadata on a document could not be decoded.
    #[error("malformed transaction metadata on {key} in {collection}: {reason}")]
    MalformedMetadata {
        /// Collection of the document.
        collection: CollectionRef,
        /// Document key.
        key: String,
        /// What was wrong.
        reason: String,
    },

    /// An ATR document could not be decoded or is inconsistent.
    #[error("ATR {key} is corrupt: {reason}")]
    AtrCorrupt {
        /// ATR document key.
        key: String,
        /// What was wrong.
        reason: String,
    },

    /// An ATR phase change outside the permitted transitions.
    #[error("invalid ATR phase transition from {from:?} to {to:?}")]
    InvalidPhaseTransition {
        /// Current phase.
        from: AtrPhase,
        /// Requested phase.
        to: AtrPhase,
    },

    /// Operation not permitted in the attempt's current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation is invalid.
        message: String,
    },

    /// A query statement could not be parsed or executed.
    #[error("query error: {message}")]
    Query {
        /// Description of the problem.
        message: String,
    },

    /// Unexpected store error.
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for TxnError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Temporary(message) => Self::TransientFailure(message),
            other => Self::Store(other),
        }
    }
}

impl TxnError {
    /// Maps a store error raised while mutating a specific document.
    pub fn from_store(err: StoreError, collection: &CollectionRef, key: &str) -> Self {
        match err {
            StoreError::CasMismatch => Self::cas_mismatch(collection, key),
            other => other.into(),
        }
    }

    /// Creates a CAS mismatch error.
    pub fn cas_mismatch(collection: &CollectionRef, key: &str) -> Self {
        Self::CasMismatch {
            collection: collection.clone(),
            key: key.to_string(),
        }
    }

    /// Creates a document not found error.
    pub fn not_found(collection: &CollectionRef, key: &str) -> Self {
        Self::DocumentNotFound {
            collection: collection.clone(),
            key: key.to_string(),
        }
    }

    /// Creates a document exists error.
    pub fn exists(collection: &CollectionRef, key: &str) -> Self {
        Self::DocumentExists {
            collection: collection.clone(),
            key: key.to_string(),
        }
    }

    /// Creates a malformed metadata error.
    pub fn malformed(collection: &CollectionRef, key: &str, reason: impl Into<String>) -> Self {
        Self::MalformedMetadata {
            collection: collection.clone(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates an ATR corruption error.
    pub fn atr_corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AtrCorrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Returns true if a fresh attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxnError::CasMismatch { .. }
                | TxnError::WriteWriteConflict { .. }
                | TxnError::TransientFailure(_)
        )
    }

    /// Returns true if this is the transaction deadline.
    pub fn is_expired(&self) -> bool {
        matches!(self, TxnError::Expired)
    }
}

/// A transaction that did not commit.
///
/// Carries the last attempt's cause and the full attempt log.
#[derive(Debug, Error)]
#[error("transaction {} ended {:?} after {} attempt(s): {cause}", .result.transaction_id, .result.final_state, .result.attempts)]
pub struct TransactionFailed {
    /// Outcome summary, including the attempt log.
    pub result: TransactionResult,
    /// The error that ended the last attempt.
    #[source]
    pub cause: TxnError,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> CollectionRef {
        CollectionRef::in_default_scope("users")
    }

    #[test]
    fn retryable_errors() {
        assert!(TxnError::cas_mismatch(&users(), "k").is_retryable());
        assert!(TxnError::TransientFailure("busy".into()).is_retryable());
        assert!(TxnError::WriteWriteConflict {
            collection: users(),
            key: "k".into(),
            blocking_attempt: AttemptId::new(),
        }
        .is_retryable());

        assert!(!TxnError::Expired.is_retryable());
        assert!(!TxnError::not_found(&users(), "k").is_retryable());
        assert!(!TxnError::malformed(&users(), "k", "bad").is_retryable());
        assert!(!TxnError::atr_corrupt("atr-1", "bad").is_retryable());
    }

    #[test]
    fn store_errors_map_by_kind() {
        let err = TxnError::from_store(StoreError::CasMismatch, &users(), "k");
        assert!(matches!(err, TxnError::CasMismatch { .. }));

        let err: TxnError = StoreError::temporary("overloaded").into();
        assert!(matches!(err, TxnError::TransientFailure(_)));

        let err: TxnError = StoreError::unavailable("gone").into();
        assert!(matches!(err, TxnError::Store(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = TxnError::not_found(&users(), "k1");
        assert_eq!(err.to_string(), "document k1 not found in _default.users");
        assert_eq!(TxnError::Expired.to_string(), "transaction expired");
    }
}
