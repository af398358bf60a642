//! Document store trait definition.

use crate::error::{StoreError, StoreResult};
use crate::types::{Cas, CollectionRef, DocumentWrite, DurabilityLevel, StoredDocument};

/// A document store with single-document compare-and-swap.
///
/// This is the only surface the transaction engine needs from a database.
/// Stores enforce single-writer-wins-by-CAS per document and read-after-write
/// consistency on a single document; everything else is built on top.
///
/// # Invariants
///
/// - Every successful `write` or `remove` changes the document's CAS
/// - `write` with `expected = None` never overwrites an existing document
/// - `write` with `expected = Some(cas)` only succeeds while the CAS matches
/// - Extended attributes are stored and returned verbatim
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing and tooling
pub trait DocumentStore: Send + Sync {
    /// Reads a document, including shadow documents.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no document exists under `key`.
    fn read(&self, collection: &CollectionRef, key: &str) -> StoreResult<StoredDocument>;

    /// Creates or replaces a document and returns its new CAS.
    ///
    /// With `expected = None` the document must not exist; with
    /// `expected = Some(cas)` it must exist with that CAS.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyExists`] on create of an existing document
    /// - [`StoreError::NotFound`] on replace of a missing document
    /// - [`StoreError::CasMismatch`] if `expected` is stale
    /// - [`StoreError::DurabilityImpossible`] if the durability cannot be met
    fn write(
        &self,
        collection: &CollectionRef,
        key: &str,
        write: DocumentWrite,
        expected: Option<Cas>,
    ) -> StoreResult<Cas>;

    /// Removes a document.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the document is already gone
    /// - [`StoreError::CasMismatch`] if `expected` is stale
    fn remove(
        &self,
        collection: &CollectionRef,
        key: &str,
        expected: Cas,
        durability: DurabilityLevel,
    ) -> StoreResult<()>;

    /// Returns true if a document with a visible body exists.
    ///
    /// # Errors
    ///
    /// Returns any error other than not-found raised by [`Self::read`].
    fn exists(&self, collection: &CollectionRef, key: &str) -> StoreResult<bool> {
        match self.read(collection, key) {
            Ok(doc) => Ok(!doc.is_shadow()),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Lists the keys in a collection, shadows included, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be scanned.
    fn keys(&self, collection: &CollectionRef) -> StoreResult<Vec<String>>;
}
