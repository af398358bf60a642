//! Per-document commit and rollback.
//!
//! Shared by attempts finishing their own work and by the cleanup sweeper
//! replaying abandoned attempts. The document's own metadata is authoritative:
//! a document whose metadata no longer names the attempt was already resolved
//! (or taken over) and is skipped, which makes every step idempotent.

use crate::error::{TxnError, TxnResult};
use crate::metadata::{self, TransactionMetadata};
use crate::staged::OperationType;
use crate::types::AttemptId;
use doctxn_store::{
    CollectionRef, DocumentStore, DocumentWrite, DurabilityLevel, StoreError, StoredDocument,
};
use tracing::debug;

/// Re-reads allowed when a concurrent writer keeps changing the document.
const MAX_RESOLVE_RETRIES: usize = 16;

/// What happened to one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// The document was updated.
    Applied,
    /// Nothing of this attempt remained on the document.
    Skipped,
}

/// Reads a document and returns it if it is still staged by `attempt_id`.
fn staged_by<S: DocumentStore + ?Sized>(
    store: &S,
    collection: &CollectionRef,
    key: &str,
    attempt_id: AttemptId,
) -> TxnResult<Option<(StoredDocument, TransactionMetadata)>> {
    let doc = match store.read(collection, key) {
        Ok(doc) => doc,
        Err(StoreError::NotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let meta = TransactionMetadata::from_xattrs(doc.xattrs.as_ref())
        .map_err(|e| TxnError::malformed(collection, key, e.to_string()))?;
    Ok(meta
        .filter(|m| m.attempt_id == attempt_id)
        .map(|m| (doc, m)))
}

/// Makes an attempt's staged change on one document visible.
pub(crate) fn commit_document<S: DocumentStore + ?Sized>(
    store: &S,
    collection: &CollectionRef,
    key: &str,
    attempt_id: AttemptId,
    durability: DurabilityLevel,
) -> TxnResult<Resolution> {
    for _ in 0..MAX_RESOLVE_RETRIES {
        let Some((doc, meta)) = staged_by(store, collection, key, attempt_id)? else {
            debug!(%collection, key, attempt = %attempt_id, "document no longer staged, skipping commit");
            return Ok(Resolution::Skipped);
        };

        let result = match meta.operation_type {
            OperationType::Insert | OperationType::Replace => {
                let content = meta.staged_content.ok_or_else(|| {
                    TxnError::malformed(collection, key, "staged content missing")
                })?;
                let write = DocumentWrite::new(Some(content), metadata::strip(doc.xattrs))
                    .with_durability(durability);
                store.write(collection, key, write, Some(doc.cas)).map(|_| ())
            }
            OperationType::Remove => store.remove(collection, key, doc.cas, durability),
        };

        match result {
            Ok(()) => {
                debug!(%collection, key, op = meta.operation_type.as_str(), "unstaged document");
                return Ok(Resolution::Applied);
            }
            // A concurrent writer changed the document; re-read and try again
            Err(StoreError::CasMismatch | StoreError::NotFound) => continue,
            Err(e) => return Err(TxnError::from_store(e, collection, key)),
        }
    }
    Err(TxnError::TransientFailure(format!(
        "document {key} in {collection} kept changing during commit"
    )))
}

/// Discards an attempt's staged change on one document.
///
/// The visible body is kept as is; shadow documents are deleted.
pub(crate) fn rollback_document<S: DocumentStore + ?Sized>(
    store: &S,
    collection: &CollectionRef,
    key: &str,
    attempt_id: AttemptId,
    durability: DurabilityLevel,
) -> TxnResult<Resolution> {
    for _ in 0..MAX_RESOLVE_RETRIES {
        let Some((doc, _)) = staged_by(store, collection, key, attempt_id)? else {
            debug!(%collection, key, attempt = %attempt_id, "document no longer staged, skipping rollback");
            return Ok(Resolution::Skipped);
        };

        let result = match doc.content {
            None => store.remove(collection, key, doc.cas, durability),
            Some(body) => {
                let write = DocumentWrite::new(Some(body), metadata::strip(doc.xattrs))
                    .with_durability(durability);
                store.write(collection, key, write, Some(doc.cas)).map(|_| ())
            }
        };

        match result {
            Ok(()) => {
                debug!(%collection, key, "discarded staged change");
                return Ok(Resolution::Applied);
            }
            Err(StoreError::CasMismatch | StoreError::NotFound) => continue,
            Err(e) => return Err(TxnError::from_store(e, collection, key)),
        }
    }
    Err(TxnError::TransientFailure(format!(
        "document {key} in {collection} kept changing during rollback"
    )))
}
