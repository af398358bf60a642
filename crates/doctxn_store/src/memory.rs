//! In-memory document store.

use crate::error::{StoreError, StoreResult};
use crate::store::DocumentStore;
use crate::types::{Cas, CollectionRef, DocumentWrite, DurabilityLevel, StoredDocument};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot format version written by [`InMemoryStore::save_snapshot`].
const SNAPSHOT_VERSION: u16 = 1;

/// An in-memory document store.
///
/// This store keeps every document in memory and is suitable for:
/// - Unit and integration tests
/// - Tooling that works on snapshot files
/// - Ephemeral deployments that don't need persistence
///
/// CAS values come from a single counter, so they are unique across the
/// whole store and strictly increasing.
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use doctxn_store::{CollectionRef, DocumentStore, InMemoryStore};
/// use serde_json::json;
///
/// let store = InMemoryStore::new();
/// let c = CollectionRef::in_default_scope("things");
/// store.upsert(&c, "k", json!(1));
/// assert_eq!(store.get(&c, "k"), Some(json!(1)));
/// ```
#[derive(Debug)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    max_durability: DurabilityLevel,
    mutations: AtomicU64,
}

#[derive(Debug, Default)]
struct StoreState {
    last_cas: u64,
    collections: BTreeMap<CollectionRef, BTreeMap<String, StoredDocument>>,
}

impl StoreState {
    fn next_cas(&mut self) -> Cas {
        self.last_cas += 1;
        Cas::new(self.last_cas)
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u16,
    last_cas: u64,
    documents: Vec<SnapshotDocument>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotDocument {
    collection: CollectionRef,
    key: String,
    cas: Cas,
    content: Option<Value>,
    xattrs: Option<Value>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            max_durability: DurabilityLevel::PersistToMajority,
            mutations: AtomicU64::new(0),
        }
    }
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that rejects writes above `level`.
    ///
    /// Useful for testing durability failures.
    #[must_use]
    pub fn with_max_durability(level: DurabilityLevel) -> Self {
        Self {
            max_durability: level,
            ..Self::default()
        }
    }

    /// Returns the visible body of a document, ignoring shadows.
    #[must_use]
    pub fn get(&self, collection: &CollectionRef, key: &str) -> Option<Value> {
        self.state
            .read()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .and_then(|doc| doc.content.clone())
    }

    /// Writes a body without any CAS check, keeping existing extended
    /// attributes.
    ///
    /// This is the behaviour of a plain, non-transactional mutation.
    pub fn upsert(&self, collection: &CollectionRef, key: &str, content: Value) -> Cas {
        let mut state = self.state.write();
        let cas = state.next_cas();
        let docs = state.collections.entry(collection.clone()).or_default();
        let xattrs = docs.get(key).and_then(|doc| doc.xattrs.clone());
        docs.insert(
            key.to_string(),
            StoredDocument {
                content: Some(content),
                cas,
                xattrs,
            },
        );
        self.mutations.fetch_add(1, Ordering::SeqCst);
        cas
    }

    /// Returns the number of successful mutations since creation.
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Returns every collection that holds at least one document.
    #[must_use]
    pub fn collections(&self) -> Vec<CollectionRef> {
        self.state
            .read()
            .collections
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(c, _)| c.clone())
            .collect()
    }

    /// Returns the number of visible (non-shadow) documents in a collection.
    #[must_use]
    pub fn document_count(&self, collection: &CollectionRef) -> usize {
        self.state
            .read()
            .collections
            .get(collection)
            .map(|docs| docs.values().filter(|d| !d.is_shadow()).count())
            .unwrap_or(0)
    }

    /// Writes every document to a CBOR snapshot file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or encoded.
    pub fn save_snapshot(&self, path: &Path) -> StoreResult<()> {
        let snapshot = {
            let state = self.state.read();
            Snapshot {
                version: SNAPSHOT_VERSION,
                last_cas: state.last_cas,
                documents: state
                    .collections
                    .iter()
                    .flat_map(|(collection, docs)| {
                        docs.iter().map(move |(key, doc)| SnapshotDocument {
                            collection: collection.clone(),
                            key: key.clone(),
                            cas: doc.cas,
                            content: doc.content.clone(),
                            xattrs: doc.xattrs.clone(),
                        })
                    })
                    .collect(),
            }
        };

        let mut writer = BufWriter::new(File::create(path)?);
        ciborium::into_writer(&snapshot, &mut writer)
            .map_err(|e| StoreError::Snapshot(e.to_string()))?;
        writer.flush()?;
        Ok(())
    }

    /// Loads a store from a CBOR snapshot file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, decoded, or has an
    /// unsupported version.
    pub fn load_snapshot(path: &Path) -> StoreResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        let snapshot: Snapshot =
            ciborium::from_reader(reader).map_err(|e| StoreError::Snapshot(e.to_string()))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut state = StoreState {
            last_cas: snapshot.last_cas,
            collections: BTreeMap::new(),
        };
        for doc in snapshot.documents {
            state.last_cas = state.last_cas.max(doc.cas.as_u64());
            state.collections.entry(doc.collection).or_default().insert(
                doc.key,
                StoredDocument {
                    content: doc.content,
                    cas: doc.cas,
                    xattrs: doc.xattrs,
                },
            );
        }

        Ok(Self {
            state: RwLock::new(state),
            ..Self::default()
        })
    }

    fn check_durability(&self, requested: DurabilityLevel) -> StoreResult<()> {
        if requested > self.max_durability {
            return Err(StoreError::DurabilityImpossible { requested });
        }
        Ok(())
    }
}

impl DocumentStore for InMemoryStore {
    fn read(&self, collection: &CollectionRef, key: &str) -> StoreResult<StoredDocument> {
        self.state
            .read()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn write(
        &self,
        collection: &CollectionRef,
        key: &str,
        write: DocumentWrite,
        expected: Option<Cas>,
    ) -> StoreResult<Cas> {
        self.check_durability(write.durability)?;

        let mut state = self.state.write();
        let current = state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .map(|doc| doc.cas);

        match (expected, current) {
            (None, Some(_)) => return Err(StoreError::AlreadyExists),
            (Some(_), None) => return Err(StoreError::NotFound),
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(StoreError::CasMismatch)
            }
            _ => {}
        }

        let cas = state.next_cas();
        state.collections.entry(collection.clone()).or_default().insert(
            key.to_string(),
            StoredDocument {
                content: write.content,
                cas,
                xattrs: write.xattrs,
            },
        );
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(cas)
    }

    fn remove(
        &self,
        collection: &CollectionRef,
        key: &str,
        expected: Cas,
        durability: DurabilityLevel,
    ) -> StoreResult<()> {
        self.check_durability(durability)?;

        let mut state = self.state.write();
        let docs = state
            .collections
            .get_mut(collection)
            .ok_or(StoreError::NotFound)?;
        let doc = docs.get(key).ok_or(StoreError::NotFound)?;
        if doc.cas != expected {
            return Err(StoreError::CasMismatch);
        }
        docs.remove(key);
        state.last_cas += 1;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn keys(&self, collection: &CollectionRef) -> StoreResult<Vec<String>> {
        Ok(self
            .state
            .read()
            .collections
            .get(collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default())
    }
}
