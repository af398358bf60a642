//! Property-based test generators using proptest.
//!
//! Provides strategies for generating staged operation sequences together
//! with a model of what each sequence should leave behind.

use doctxn_core::{AttemptContext, TxnError, TxnResult};
use doctxn_store::{CollectionRef, DocumentStore};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// A transactional operation on one key.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedOp {
    /// Insert a document.
    Insert(String, Value),
    /// Replace a document's content.
    Replace(String, Value),
    /// Remove a document.
    Remove(String),
}

impl StagedOp {
    /// Returns the key the operation touches.
    pub fn key(&self) -> &str {
        match self {
            StagedOp::Insert(key, _) | StagedOp::Replace(key, _) | StagedOp::Remove(key) => key,
        }
    }

    /// Applies the operation through an attempt.
    pub fn apply<S: DocumentStore + ?Sized>(
        &self,
        ctx: &mut AttemptContext<'_, S>,
        collection: &CollectionRef,
    ) -> TxnResult<()> {
        match self {
            StagedOp::Insert(key, content) => ctx.insert(collection, key, content.clone()).map(|_| ()),
            StagedOp::Replace(key, content) => {
                ctx.replace(collection, key, content.clone()).map(|_| ())
            }
            StagedOp::Remove(key) => ctx.remove(collection, key),
        }
    }
}

/// Expected visible state of a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentModel {
    documents: BTreeMap<String, Value>,
}

impl DocumentModel {
    /// Creates a model from initial documents.
    pub fn new(initial: &BTreeMap<String, Value>) -> Self {
        Self {
            documents: initial.clone(),
        }
    }

    /// Applies an operation, returning whether it should succeed.
    ///
    /// A failing operation leaves the model unchanged.
    pub fn apply(&mut self, op: &StagedOp) -> bool {
        match op {
            StagedOp::Insert(key, content) => {
                if self.documents.contains_key(key) {
                    return false;
                }
                self.documents.insert(key.clone(), content.clone());
                true
            }
            StagedOp::Replace(key, content) => match self.documents.get_mut(key) {
                Some(existing) => {
                    *existing = content.clone();
                    true
                }
                None => false,
            },
            StagedOp::Remove(key) => self.documents.remove(key).is_some(),
        }
    }

    /// Returns the expected documents.
    pub fn documents(&self) -> &BTreeMap<String, Value> {
        &self.documents
    }
}

/// Returns true if `err` is the rejection an operation the model refuses
/// should produce.
pub fn is_expected_rejection(err: &TxnError) -> bool {
    matches!(
        err,
        TxnError::DocumentExists { .. } | TxnError::DocumentNotFound { .. }
    )
}

/// Strategy for document keys drawn from a small pool so operations collide.
pub fn key_strategy() -> impl Strategy<Value = String> {
    (0u8..6).prop_map(|i| format!("k{i}"))
}

/// Strategy for small JSON document bodies.
pub fn content_strategy() -> impl Strategy<Value = Value> {
    (any::<i32>(), "[a-z]{0,8}").prop_map(|(n, s)| json!({"n": n, "s": s}))
}

/// Strategy for a single staged operation.
pub fn staged_op_strategy() -> impl Strategy<Value = StagedOp> {
    prop_oneof![
        (key_strategy(), content_strategy()).prop_map(|(k, v)| StagedOp::Insert(k, v)),
        (key_strategy(), content_strategy()).prop_map(|(k, v)| StagedOp::Replace(k, v)),
        key_strategy().prop_map(StagedOp::Remove),
    ]
}

/// Strategy for a sequence of staged operations.
pub fn op_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<StagedOp>> {
    prop::collection::vec(staged_op_strategy(), 1..=max_len.max(1))
}

/// Strategy for the documents present before a transaction.
pub fn initial_documents_strategy() -> impl Strategy<Value = BTreeMap<String, Value>> {
    prop::collection::btree_map(key_strategy(), content_strategy(), 0..4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_follows_document_semantics() {
        let mut model = DocumentModel::default();
        assert!(model.apply(&StagedOp::Insert("a".into(), json!(1))));
        assert!(!model.apply(&StagedOp::Insert("a".into(), json!(2))));
        assert!(model.apply(&StagedOp::Replace("a".into(), json!(3))));
        assert!(model.apply(&StagedOp::Remove("a".into())));
        assert!(!model.apply(&StagedOp::Remove("a".into())));
        assert!(!model.apply(&StagedOp::Replace("a".into(), json!(4))));
        assert!(model.documents().is_empty());
    }

    proptest! {
        #[test]
        fn keys_come_from_the_pool(op in staged_op_strategy()) {
            prop_assert!(op.key().starts_with('k'));
            prop_assert_eq!(op.key().len(), 2);
        }
    }
}
