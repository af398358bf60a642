//! Attempt context: one execution of user logic.
//!
//! An attempt stages its writes as metadata on the touched documents and
//! records each one in its ATR entry before touching the document. Nothing is
//! visible to other readers until [`AttemptContext::commit`] passes the commit
//! point.
//!
//! ## Reads
//!
//! | Document state | Result |
//! |---|---|
//! | staged by this attempt (insert/replace) | staged content |
//! | staged by this attempt (remove) | not found |
//! | staged by a live foreign attempt | write-write conflict |
//! | staged by a dead attempt, or not staged | real content |
//!
//! An attempt is dead when its ATR entry is terminal, expired or missing, or
//! when it is an earlier attempt of the same transaction.

use crate::atr::{self, AtrDocument, AtrEntry, AtrPhase, AtrRef, StagedMutationRef};
use crate::config::ResolvedOptions;
use crate::error::{TxnError, TxnResult};
use crate::metadata::TransactionMetadata;
use crate::query::{self, QueryOptions, QueryResult};
use crate::resolve::{self, Resolution};
use crate::staged::{OperationType, StagedMutation, StagedMutations};
use crate::types::{now_millis, AttemptId, TransactionId};
use doctxn_store::{Cas, CollectionRef, DocumentStore, DocumentWrite, StoreError, StoredDocument};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Bound on foreign stagings settled for one document in one call.
const MAX_FOREIGN_SETTLE_ROUNDS: usize = 4;

/// A document as seen from inside an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionDocument {
    /// Collection of the document.
    pub collection: CollectionRef,
    /// Document key.
    pub key: String,
    /// Content visible to this attempt.
    pub content: Value,
    /// CAS this attempt last observed.
    pub cas: Cas,
}

/// One attempt of a transaction.
///
/// Created by [`crate::Transactions`]; user logic receives it by mutable
/// reference and performs every transactional operation through it.
pub struct AttemptContext<'t, S: DocumentStore + ?Sized> {
    store: &'t S,
    transaction_id: TransactionId,
    attempt_id: AttemptId,
    options: ResolvedOptions,
    deadline: Instant,
    start_timestamp: u64,
    atr: AtrRef,
    atr_entry_created: bool,
    phase: AtrPhase,
    staged: StagedMutations,
    observed: HashMap<(CollectionRef, String), Cas>,
}

impl<'t, S: DocumentStore + ?Sized> AttemptContext<'t, S> {
    pub(crate) fn new(
        store: &'t S,
        transaction_id: TransactionId,
        options: ResolvedOptions,
        deadline: Instant,
        start_timestamp: u64,
    ) -> Self {
        let atr = AtrRef::for_transaction(&options.metadata_collection, transaction_id);
        Self {
            store,
            transaction_id,
            attempt_id: AttemptId::new(),
            options,
            deadline,
            start_timestamp,
            atr,
            atr_entry_created: false,
            phase: AtrPhase::Pending,
            staged: StagedMutations::new(),
            observed: HashMap::new(),
        }
    }

    /// Returns the transaction id.
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Returns this attempt's id.
    pub fn attempt_id(&self) -> AttemptId {
        self.attempt_id
    }

    /// Returns the attempt's phase.
    ///
    /// An attempt that has not staged anything reports Pending even though no
    /// ATR entry exists yet.
    pub fn phase(&self) -> AtrPhase {
        self.phase
    }

    /// Returns the ATR document this attempt records itself in.
    pub fn atr_ref(&self) -> &AtrRef {
        &self.atr
    }

    /// Returns the number of documents currently staged.
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// Returns the mutations staged so far, in staging order.
    pub fn staged(&self) -> &StagedMutations {
        &self.staged
    }

    pub(crate) fn ensure_pending(&self) -> TxnResult<()> {
        if self.phase != AtrPhase::Pending {
            return Err(TxnError::invalid_operation(format!(
                "attempt {} is {:?}",
                self.attempt_id, self.phase
            )));
        }
        Ok(())
    }

    fn check_expiry(&self) -> TxnResult<()> {
        if Instant::now() >= self.deadline {
            debug!(txn = %self.transaction_id, attempt = %self.attempt_id, "deadline reached");
            return Err(TxnError::Expired);
        }
        Ok(())
    }

    /// Reads a document.
    ///
    /// # Errors
    ///
    /// - [`TxnError::DocumentNotFound`] if the document is absent for this attempt
    /// - [`TxnError::WriteWriteConflict`] if a live foreign attempt staged it
    pub fn get(&mut self, collection: &CollectionRef, key: &str) -> TxnResult<TransactionDocument> {
        self.get_optional(collection, key)?
            .ok_or_else(|| TxnError::not_found(collection, key))
    }

    /// Reads a document, returning `None` if it is absent for this attempt.
    pub fn get_optional(
        &mut self,
        collection: &CollectionRef,
        key: &str,
    ) -> TxnResult<Option<TransactionDocument>> {
        self.ensure_pending()?;
        self.check_expiry()?;

        if let Some(own) = self.staged.find(collection, key) {
            return Ok(match (own.operation, &own.staged_content) {
                (OperationType::Remove, _) | (_, None) => None,
                (_, Some(content)) => Some(TransactionDocument {
                    collection: collection.clone(),
                    key: key.to_string(),
                    content: content.clone(),
                    cas: own.staged_cas,
                }),
            });
        }

        let current = match self.read_raw(collection, key)? {
            Some(doc) => self.settle_foreign_staging(collection, key, doc)?,
            None => None,
        };
        let Some(doc) = current else {
            self.observed.remove(&(collection.clone(), key.to_string()));
            return Ok(None);
        };
        self.observed
            .insert((collection.clone(), key.to_string()), doc.cas);

        Ok(doc.content.map(|content| TransactionDocument {
            collection: collection.clone(),
            key: key.to_string(),
            content,
            cas: doc.cas,
        }))
    }

    /// Returns true if the document exists for this attempt.
    pub fn exists(&mut self, collection: &CollectionRef, key: &str) -> TxnResult<bool> {
        Ok(self.get_optional(collection, key)?.is_some())
    }

    /// Stages creation of a document.
    ///
    /// # Errors
    ///
    /// Returns [`TxnError::DocumentExists`] if the document is visible to
    /// this attempt.
    pub fn insert(
        &mut self,
        collection: &CollectionRef,
        key: &str,
        content: Value,
    ) -> TxnResult<TransactionDocument> {
        self.stage(collection, key, OperationType::Insert, Some(content.clone()))
            .map(|cas| TransactionDocument {
                collection: collection.clone(),
                key: key.to_string(),
                content,
                cas,
            })
    }

    /// Stages replacement of a document's content.
    ///
    /// # Errors
    ///
    /// Returns [`TxnError::DocumentNotFound`] if the document is absent for
    /// this attempt.
    pub fn replace(
        &mut self,
        collection: &CollectionRef,
        key: &str,
        content: Value,
    ) -> TxnResult<TransactionDocument> {
        self.stage(collection, key, OperationType::Replace, Some(content.clone()))
            .map(|cas| TransactionDocument {
                collection: collection.clone(),
                key: key.to_string(),
                content,
                cas,
            })
    }

    /// Stages removal of a document.
    pub fn remove(&mut self, collection: &CollectionRef, key: &str) -> TxnResult<()> {
        self.stage(collection, key, OperationType::Remove, None)
            .map(|_| ())
    }

    /// Runs a statement against this attempt.
    ///
    /// Statements are executed as gets and staged writes on each affected
    /// document, so they obey the same isolation as the key-value calls.
    pub fn query(&mut self, statement: &str, options: &QueryOptions) -> TxnResult<QueryResult> {
        self.ensure_pending()?;
        self.check_expiry()?;
        query::execute(self, statement, options)
    }

    /// Stages one operation on a document.
    ///
    /// Returns the CAS of the staged document; for a staged insert folded
    /// away by a remove this is the CAS the shadow had before deletion.
    fn stage(
        &mut self,
        collection: &CollectionRef,
        key: &str,
        operation: OperationType,
        content: Option<Value>,
    ) -> TxnResult<Cas> {
        self.ensure_pending()?;
        self.check_expiry()?;

        let mut current = self.read_raw(collection, key)?;

        let (effective, expected, pre_image, pre_cas) =
            match self.staged.find(collection, key).cloned() {
                Some(own) => {
                    let effective = fold(collection, key, own.operation, operation)?;
                    match effective {
                        Some(op) => (op, Some(own.staged_cas), own.pre_image, own.pre_cas),
                        None => return self.unstage_insert(collection, key, own.staged_cas),
                    }
                }
                None => {
                    if let Some(doc) = current.take() {
                        current = self.settle_foreign_staging(collection, key, doc)?;
                    }
                    let visible = current.as_ref().and_then(|d| d.content.clone());
                    match (operation, &visible) {
                        (OperationType::Insert, Some(_)) => {
                            return Err(TxnError::exists(collection, key))
                        }
                        (OperationType::Replace | OperationType::Remove, None) => {
                            return Err(TxnError::not_found(collection, key))
                        }
                        _ => {}
                    }
                    let observed = self
                        .observed
                        .get(&(collection.clone(), key.to_string()))
                        .copied();
                    let current_cas = current.as_ref().map(|d| d.cas);
                    let expected = observed.or(current_cas);
                    (operation, expected, visible, current_cas)
                }
            };

        self.record_in_atr(StagedMutationRef {
            collection: collection.clone(),
            document_key: key.to_string(),
            operation_type: effective,
            cas_before_staging: pre_cas,
        })?;

        let staged_content = match effective {
            OperationType::Remove => None,
            _ => content,
        };
        let metadata = TransactionMetadata {
            txn_id: self.transaction_id,
            attempt_id: self.attempt_id,
            operation_type: effective,
            atr_ref: self.atr.clone(),
            staged_content: staged_content.clone(),
        };
        let (body, xattrs) = match current {
            Some(doc) => (doc.content, doc.xattrs),
            None => (None, None),
        };
        let xattrs = metadata
            .into_xattrs(xattrs)
            .map_err(|e| TxnError::malformed(collection, key, e.to_string()))?;
        let write = DocumentWrite::new(body, Some(xattrs)).with_durability(self.options.durability);

        let staged_cas = self
            .store
            .write(collection, key, write, expected)
            .map_err(|e| match e {
                // The document appeared or vanished since it was last seen
                StoreError::AlreadyExists | StoreError::NotFound => {
                    TxnError::cas_mismatch(collection, key)
                }
                other => TxnError::from_store(other, collection, key),
            })?;

        debug!(
            txn = %self.transaction_id,
            attempt = %self.attempt_id,
            %collection,
            key,
            op = effective.as_str(),
            "staged document"
        );

        self.observed
            .insert((collection.clone(), key.to_string()), staged_cas);
        self.staged.upsert(StagedMutation {
            collection: collection.clone(),
            key: key.to_string(),
            operation: effective,
            staged_content,
            pre_image,
            pre_cas,
            staged_cas,
        });
        Ok(staged_cas)
    }

    /// Deletes the shadow of an insert this attempt staged and forgets it.
    fn unstage_insert(&mut self, collection: &CollectionRef, key: &str, cas: Cas) -> TxnResult<Cas> {
        self.store
            .remove(collection, key, cas, self.options.durability)
            .map_err(|e| match e {
                StoreError::NotFound => TxnError::cas_mismatch(collection, key),
                other => TxnError::from_store(other, collection, key),
            })?;
        self.staged.remove(collection, key);
        self.observed.remove(&(collection.clone(), key.to_string()));
        debug!(attempt = %self.attempt_id, %collection, key, "dropped staged insert");
        Ok(cas)
    }

    fn read_raw(&self, collection: &CollectionRef, key: &str) -> TxnResult<Option<StoredDocument>> {
        match self.store.read(collection, key) {
            Ok(doc) => Ok(Some(doc)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(TxnError::from_store(e, collection, key)),
        }
    }

    /// Settles staging another attempt left on `doc` before this attempt
    /// reads or overwrites it, returning the document as it then stands.
    ///
    /// | Staging attempt | Action |
    /// |---|---|
    /// | live | write-write conflict |
    /// | Committed, or Committing and expired | document committed forward |
    /// | Pending and expired | entry taken over to Aborting, body authoritative |
    /// | Aborting and expired, RolledBack, or no entry | body authoritative |
    ///
    /// An earlier attempt of this transaction is handled as expired.
    fn settle_foreign_staging(
        &self,
        collection: &CollectionRef,
        key: &str,
        mut doc: StoredDocument,
    ) -> TxnResult<Option<StoredDocument>> {
        for _ in 0..MAX_FOREIGN_SETTLE_ROUNDS {
            let meta = TransactionMetadata::from_xattrs(doc.xattrs.as_ref())
                .map_err(|e| TxnError::malformed(collection, key, e.to_string()))?;
            let Some(meta) = meta else {
                return Ok(Some(doc));
            };
            if meta.attempt_id == self.attempt_id {
                return Ok(Some(doc));
            }
            let Some((atr_doc, atr_cas)) = atr::load(self.store, &meta.atr_ref)? else {
                return Ok(Some(doc));
            };
            let Some(entry) = atr_doc.entry(meta.attempt_id) else {
                return Ok(Some(doc));
            };
            let stale = meta.txn_id == self.transaction_id || entry.is_expired(now_millis());

            match entry.phase {
                AtrPhase::RolledBack => return Ok(Some(doc)),
                AtrPhase::Aborting if stale => return Ok(Some(doc)),
                AtrPhase::Pending if stale => {
                    self.abort_foreign(collection, key, &meta, atr_doc.clone(), atr_cas)?;
                    return Ok(Some(doc));
                }
                AtrPhase::Committed | AtrPhase::Committing
                    if stale || entry.phase == AtrPhase::Committed =>
                {
                    resolve::commit_document(
                        self.store,
                        collection,
                        key,
                        meta.attempt_id,
                        entry.durability_level,
                    )?;
                    debug!(
                        attempt = %self.attempt_id,
                        foreign = %meta.attempt_id,
                        %collection,
                        key,
                        "committed foreign staging forward"
                    );
                    match self.read_raw(collection, key)? {
                        Some(fresh) => doc = fresh,
                        None => return Ok(None),
                    }
                }
                _ => return Err(self.write_write_conflict(collection, key, meta.attempt_id)),
            }
        }
        Err(TxnError::TransientFailure(format!(
            "document {key} in {collection} kept being restaged"
        )))
    }

    /// Moves an expired Pending foreign entry to Aborting so that cleanup
    /// rolls it back instead of committing it forward.
    ///
    /// The transition is a single CAS write against the ATR state the
    /// decision was made on; losing that race is a write-write conflict.
    fn abort_foreign(
        &self,
        collection: &CollectionRef,
        key: &str,
        meta: &TransactionMetadata,
        mut atr_doc: AtrDocument,
        atr_cas: Cas,
    ) -> TxnResult<()> {
        let entry = atr_doc
            .entry_mut(meta.attempt_id)
            .ok_or_else(|| self.write_write_conflict(collection, key, meta.attempt_id))?;
        entry.transition(AtrPhase::Aborting)?;
        let durability = entry.durability_level;

        match atr::store_document(self.store, &meta.atr_ref, &atr_doc, Some(atr_cas), durability)? {
            Ok(_) => {
                info!(
                    txn = %self.transaction_id,
                    attempt = %self.attempt_id,
                    foreign = %meta.attempt_id,
                    atr = %meta.atr_ref.key,
                    "aborted expired attempt"
                );
                Ok(())
            }
            Err(StoreError::CasMismatch | StoreError::NotFound) => {
                Err(self.write_write_conflict(collection, key, meta.attempt_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_write_conflict(
        &self,
        collection: &CollectionRef,
        key: &str,
        blocking_attempt: AttemptId,
    ) -> TxnError {
        warn!(
            txn = %self.transaction_id,
            attempt = %self.attempt_id,
            %collection,
            key,
            blocking = %blocking_attempt,
            "write-write conflict"
        );
        TxnError::WriteWriteConflict {
            collection: collection.clone(),
            key: key.to_string(),
            blocking_attempt,
        }
    }

    fn record_in_atr(&mut self, mutation: StagedMutationRef) -> TxnResult<()> {
        if self.atr_entry_created {
            atr::mutate_entry(
                self.store,
                &self.atr,
                self.attempt_id,
                self.options.durability,
                |entry| entry.record(mutation.clone()),
            )?;
            return Ok(());
        }

        let mut entry = AtrEntry::new(
            self.transaction_id,
            self.attempt_id,
            self.start_timestamp,
            self.options.timeout.as_millis() as u64,
            self.options.durability,
        );
        entry.record(mutation)?;
        atr::add_entry(self.store, &self.atr, &entry, self.options.durability)?;
        self.atr_entry_created = true;
        debug!(txn = %self.transaction_id, attempt = %self.attempt_id, atr = %self.atr.key, "created ATR entry");
        Ok(())
    }

    /// Commits the attempt.
    ///
    /// The deadline is only checked before the commit point. Once the ATR
    /// entry is Committing the attempt can only move forward, and a failure
    /// while unstaging leaves the remaining documents to the cleanup sweeper.
    /// Calling `commit` again on a Committing attempt resumes unstaging.
    pub fn commit(&mut self) -> TxnResult<()> {
        match self.phase {
            AtrPhase::Pending => {
                self.check_expiry()?;
                if !self.atr_entry_created {
                    self.phase = AtrPhase::Committed;
                    debug!(txn = %self.transaction_id, attempt = %self.attempt_id, "committed read-only attempt");
                    return Ok(());
                }
                self.set_phase(AtrPhase::Committing)?;
            }
            AtrPhase::Committing => {}
            other => {
                return Err(TxnError::invalid_operation(format!(
                    "cannot commit an attempt that is {other:?}"
                )))
            }
        }

        for m in self.staged.iter() {
            let resolution = resolve::commit_document(
                self.store,
                &m.collection,
                &m.key,
                self.attempt_id,
                self.options.durability,
            )?;
            if resolution == Resolution::Skipped {
                warn!(
                    attempt = %self.attempt_id,
                    collection = %m.collection,
                    key = %m.key,
                    "staged change lost to a non-transactional write"
                );
            }
        }

        self.set_phase(AtrPhase::Committed)?;
        info!(
            txn = %self.transaction_id,
            attempt = %self.attempt_id,
            documents = self.staged.len(),
            "transaction committed"
        );
        Ok(())
    }

    /// Rolls the attempt back.
    ///
    /// User logic may call this to abandon the transaction; the orchestrator
    /// then reports it as rolled back without retrying. Rolling back an
    /// attempt that is already rolled back is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TxnError::InvalidOperation`] once the commit point has passed.
    pub fn rollback(&mut self) -> TxnResult<()> {
        match self.phase {
            AtrPhase::RolledBack => return Ok(()),
            AtrPhase::Committing | AtrPhase::Committed => {
                return Err(TxnError::invalid_operation(
                    "cannot roll back after the commit point",
                ))
            }
            AtrPhase::Pending => {
                if !self.atr_entry_created {
                    self.phase = AtrPhase::RolledBack;
                    return Ok(());
                }
                self.set_phase(AtrPhase::Aborting)?;
            }
            AtrPhase::Aborting => {}
        }

        for m in self.staged.iter() {
            resolve::rollback_document(
                self.store,
                &m.collection,
                &m.key,
                self.attempt_id,
                self.options.durability,
            )?;
        }

        self.set_phase(AtrPhase::RolledBack)?;
        info!(
            txn = %self.transaction_id,
            attempt = %self.attempt_id,
            documents = self.staged.len(),
            "attempt rolled back"
        );
        Ok(())
    }

    /// Moves the ATR entry to `next`, accepting an entry already there.
    fn set_phase(&mut self, next: AtrPhase) -> TxnResult<()> {
        atr::mutate_entry(
            self.store,
            &self.atr,
            self.attempt_id,
            self.options.durability,
            |entry| {
                if entry.phase == next {
                    Ok(())
                } else {
                    entry.transition(next)
                }
            },
        )?;
        debug!(attempt = %self.attempt_id, phase = ?next, "ATR phase changed");
        self.phase = next;
        Ok(())
    }
}

/// Combines an operation with one this attempt already staged on the same
/// document. `None` means the two cancel out.
fn fold(
    collection: &CollectionRef,
    key: &str,
    staged: OperationType,
    next: OperationType,
) -> TxnResult<Option<OperationType>> {
    use OperationType::*;
    match (staged, next) {
        (Insert, Replace) => Ok(Some(Insert)),
        (Insert, Remove) => Ok(None),
        (Replace, Replace) => Ok(Some(Replace)),
        (Replace, Remove) => Ok(Some(Remove)),
        (Remove, Insert) => Ok(Some(Replace)),
        (Insert | Replace, Insert) => Err(TxnError::exists(collection, key)),
        (Remove, Replace | Remove) => Err(TxnError::not_found(collection, key)),
    }
}
