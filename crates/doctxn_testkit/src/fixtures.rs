//! Test fixtures and store helpers.
//!
//! Provides convenience functions for setting up stores, configurations and
//! snapshot files for common test scenarios.

use doctxn_core::{RetryConfig, TransactionConfig, Transactions};
use doctxn_store::{CollectionRef, DocumentStore, InMemoryStore, StoreResult};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// The collection most tests write to.
pub fn users() -> CollectionRef {
    CollectionRef::in_default_scope("users")
}

/// A second collection for cross-collection tests.
pub fn accounts() -> CollectionRef {
    CollectionRef::new("bank", "accounts")
}

/// Creates a store holding `documents` in [`users`].
pub fn seeded_store(documents: &[(&str, Value)]) -> Arc<InMemoryStore> {
    let store = InMemoryStore::new();
    for (key, content) in documents {
        store.upsert(&users(), key, content.clone());
    }
    Arc::new(store)
}

/// A config for tests: short timeout, no backoff, no grace period.
pub fn fast_config() -> TransactionConfig {
    TransactionConfig::new()
        .with_timeout(Duration::from_secs(5))
        .with_retry(RetryConfig::immediate())
        .with_cleanup_grace_period(Duration::ZERO)
        .with_cleanup_poll_interval(Duration::from_millis(10))
}

/// Creates an orchestrator over `store` with [`fast_config`].
pub fn transactions<S: DocumentStore + 'static>(store: &Arc<S>) -> Transactions<S> {
    Transactions::new(Arc::clone(store), fast_config())
}

/// Returns the ATR keys currently in the default metadata collection.
pub fn atr_keys<S: DocumentStore>(store: &S) -> Vec<String> {
    store
        .keys(&TransactionConfig::default().metadata_collection)
        .unwrap_or_default()
}

/// A snapshot file in a temporary directory, removed on drop.
pub struct TempSnapshot {
    _dir: TempDir,
    path: PathBuf,
}

impl TempSnapshot {
    /// Creates an empty location for a snapshot file.
    pub fn new() -> std::io::Result<Self> {
        let dir = TempDir::new()?;
        let path = dir.path().join("store.snapshot");
        Ok(Self { _dir: dir, path })
    }

    /// Saves `store` into a fresh snapshot file.
    pub fn of(store: &InMemoryStore) -> StoreResult<Self> {
        let snapshot = Self::new()?;
        store.save_snapshot(&snapshot.path)?;
        Ok(snapshot)
    }

    /// Returns the snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot into a new store.
    pub fn load(&self) -> StoreResult<InMemoryStore> {
        InMemoryStore::load_snapshot(&self.path)
    }
}
