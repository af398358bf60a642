//! # doctxn Store
//!
//! Document store adapter for doctxn.
//!
//! This crate defines the narrow key-value surface the transaction engine
//! consumes from a document database. Stores are **single-document CAS
//! stores** - they know nothing about transactions, staging, or ATRs.
//!
//! ## Design Principles
//!
//! - Every mutation is guarded by a CAS token or an "must not exist" check
//! - Extended attributes are opaque JSON owned by the caller
//! - Must be `Send + Sync` for concurrent access
//! - The transaction engine owns all metadata interpretation
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing, tooling and ephemeral use
//!
//! ## Example
//!
//! ```rust
//! use doctxn_store::{CollectionRef, DocumentStore, DocumentWrite, InMemoryStore};
//! use serde_json::json;
//!
//! let store = InMemoryStore::new();
//! let users = CollectionRef::new("app", "users");
//! let cas = store.write(&users, "u1", DocumentWrite::body(json!({"n": 1})), None).unwrap();
//! let doc = store.read(&users, "u1").unwrap();
//! assert_eq!(doc.cas, cas);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod store;
mod types;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use store::DocumentStore;
pub use types::{Cas, CollectionRef, DocumentWrite, DurabilityLevel, StoredDocument};
