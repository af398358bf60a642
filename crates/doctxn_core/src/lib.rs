//! # doctxn Core
//!
//! Client-side multi-document transactions over a document store that only
//! offers single-document compare-and-swap.
//!
//! This crate provides:
//! - Attempt context with staged get/insert/replace/remove and statements
//! - Atomic Transaction Records (ATR) tracking every attempt's phase
//! - Transaction orchestrator with retry, backoff and expiry
//! - Cleanup sweeper that finishes abandoned attempts
//!
//! ## Protocol
//!
//! 1. Each write is recorded in the attempt's ATR entry, then staged as
//!    metadata on the document (a shadow document for inserts)
//! 2. Commit moves the ATR entry Pending → Committing (the commit point)
//! 3. Staged content is copied into each document and the metadata removed
//! 4. The ATR entry is marked Committed
//!
//! Rollback mirrors this through Aborting → RolledBack, stripping metadata
//! and deleting shadows.
//!
//! ## Key Invariants
//!
//! - A document is staged by at most one live attempt
//! - Nothing staged is visible to other readers before the commit point
//! - After the commit point a transaction only moves forward
//! - Every commit and rollback step is idempotent
//! - All coordination is CAS on documents and ATRs; there is no global lock

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod atr;
mod attempt;
mod cleanup;
mod config;
mod error;
mod metadata;
mod query;
mod resolve;
mod staged;
mod transactions;
mod types;

pub use atr::{AtrDocument, AtrEntry, AtrPhase, AtrRef, CleanupClaim, StagedMutationRef};
pub use attempt::{AttemptContext, TransactionDocument};
pub use cleanup::{CleanupHandle, CleanupReport, CleanupSweeper};
pub use config::{RetryConfig, TransactionConfig, TransactionOptions, DEFAULT_METADATA_COLLECTION};
pub use error::{TransactionFailed, TxnError, TxnResult};
pub use metadata::{MetadataError, TransactionMetadata, TXN_XATTR_KEY};
pub use query::{QueryOptions, QueryResult};
pub use staged::{OperationType, StagedMutation, StagedMutations};
pub use transactions::{
    AttemptLog, AttemptOutcome, FinalState, OutcomeKind, TransactionResult, Transactions,
};
pub use types::{AttemptId, TransactionId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
