//! Staged mutations tracked by an attempt.

use doctxn_store::{Cas, CollectionRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of change staged on a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Document is created on commit.
    Insert,
    /// Document body is replaced on commit.
    Replace,
    /// Document is deleted on commit.
    Remove,
}

impl OperationType {
    /// Returns a lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Replace => "replace",
            OperationType::Remove => "remove",
        }
    }
}

/// One document's intended change within an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedMutation {
    /// Collection of the document.
    pub collection: CollectionRef,
    /// Document key.
    pub key: String,
    /// Staged operation.
    pub operation: OperationType,
    /// Content the document will have after commit (`None` for removes).
    pub staged_content: Option<Value>,
    /// Visible content before staging (`None` for inserts).
    pub pre_image: Option<Value>,
    /// CAS of the document before this attempt first staged it.
    pub pre_cas: Option<Cas>,
    /// CAS of the document carrying the staging metadata.
    pub staged_cas: Cas,
}

/// The ordered set of mutations staged by one attempt.
///
/// At most one entry exists per document; re-staging a document replaces its
/// entry in place so the original staging order is kept.
#[derive(Debug, Clone, Default)]
pub struct StagedMutations {
    items: Vec<StagedMutation>,
}

impl StagedMutations {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the mutation staged for a document.
    pub fn find(&self, collection: &CollectionRef, key: &str) -> Option<&StagedMutation> {
        self.items
            .iter()
            .find(|m| m.key == key && &m.collection == collection)
    }

    /// Records a mutation, replacing any previous one for the same document.
    pub fn upsert(&mut self, mutation: StagedMutation) {
        match self
            .items
            .iter_mut()
            .find(|m| m.key == mutation.key && m.collection == mutation.collection)
        {
            Some(existing) => *existing = mutation,
            None => self.items.push(mutation),
        }
    }

    /// Drops the mutation for a document, returning it.
    pub fn remove(&mut self, collection: &CollectionRef, key: &str) -> Option<StagedMutation> {
        let index = self
            .items
            .iter()
            .position(|m| m.key == key && &m.collection == collection)?;
        Some(self.items.remove(index))
    }

    /// Iterates in staging order.
    pub fn iter(&self) -> impl Iterator<Item = &StagedMutation> {
        self.items.iter()
    }

    /// Returns the number of staged documents.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
