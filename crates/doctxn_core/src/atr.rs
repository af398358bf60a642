//! Atomic Transaction Records.
//!
//! Each transaction owns one ATR document in the metadata collection, keyed
//! `atr-<transaction id>`. Every attempt adds an [`AtrEntry`] to it holding the
//! attempt's phase and the documents it staged. The ATR is the single source of
//! truth for whether an attempt's staged changes become visible: the
//! Pending→Committing transition is the commit point.
//!
//! All ATR updates are read-modify-write cycles guarded by the document CAS.

use crate::error::{TxnError, TxnResult};
use crate::staged::OperationType;
use crate::types::{AttemptId, TransactionId};
use doctxn_store::{Cas, CollectionRef, DocumentStore, DocumentWrite, DurabilityLevel, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How many times an owner retries an ATR update that lost a CAS race.
const MAX_ATR_UPDATE_RETRIES: usize = 16;

/// Phase of one attempt as recorded in its ATR entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtrPhase {
    /// Staging in progress.
    Pending,
    /// Commit point passed; documents are being unstaged.
    Committing,
    /// All documents unstaged.
    Committed,
    /// Rollback in progress.
    Aborting,
    /// All staged changes discarded.
    RolledBack,
}

impl AtrPhase {
    /// Returns true for phases that never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AtrPhase::Committed | AtrPhase::RolledBack)
    }

    /// Returns true while the attempt may still hold documents.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true if the commit point has been passed.
    pub fn is_past_commit_point(&self) -> bool {
        matches!(self, AtrPhase::Committing | AtrPhase::Committed)
    }

    /// Returns true if `next` is a permitted successor of this phase.
    pub fn can_transition_to(&self, next: AtrPhase) -> bool {
        matches!(
            (self, next),
            (AtrPhase::Pending, AtrPhase::Committing)
                | (AtrPhase::Pending, AtrPhase::Aborting)
                | (AtrPhase::Committing, AtrPhase::Committed)
                | (AtrPhase::Aborting, AtrPhase::RolledBack)
        )
    }
}

/// Location of an ATR document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtrRef {
    /// Metadata collection.
    pub collection: CollectionRef,
    /// ATR document key.
    pub key: String,
}

impl AtrRef {
    /// Key prefix shared by every ATR document.
    pub const KEY_PREFIX: &'static str = "atr-";

    /// Returns the ATR location for a transaction.
    pub fn for_transaction(metadata_collection: &CollectionRef, transaction_id: TransactionId) -> Self {
        Self {
            collection: metadata_collection.clone(),
            key: format!("{}{}", Self::KEY_PREFIX, transaction_id),
        }
    }
}

/// A document recorded in an ATR entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedMutationRef {
    /// Collection of the document.
    pub collection: CollectionRef,
    /// Document key.
    pub document_key: String,
    /// Staged operation.
    pub operation_type: OperationType,
    /// CAS of the document when staging began (`None` if it did not exist).
    pub cas_before_staging: Option<Cas>,
}

/// Ownership marker written by a sweeper that is resolving an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupClaim {
    /// Sweeper id.
    pub owner: String,
    /// When the claim was taken (ms since the Unix epoch).
    pub claimed_at: u64,
}

/// One attempt's record inside an ATR document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtrEntry {
    /// Owning transaction.
    pub transaction_id: TransactionId,
    /// Owning attempt.
    pub attempt_id: AttemptId,
    /// Current phase.
    pub phase: AtrPhase,
    /// Transaction start (ms since the Unix epoch).
    pub start_timestamp: u64,
    /// Transaction timeout in ms.
    pub expiry_duration: u64,
    /// Durability used for the attempt's writes.
    pub durability_level: DurabilityLevel,
    /// Documents staged by the attempt, in staging order.
    pub mutations: Vec<StagedMutationRef>,
    /// Sweeper currently resolving this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupClaim>,
}

impl AtrEntry {
    /// Creates a Pending entry with no mutations.
    pub fn new(
        transaction_id: TransactionId,
        attempt_id: AttemptId,
        start_timestamp: u64,
        expiry_duration: u64,
        durability_level: DurabilityLevel,
    ) -> Self {
        Self {
            transaction_id,
            attempt_id,
            phase: AtrPhase::Pending,
            start_timestamp,
            expiry_duration,
            durability_level,
            mutations: Vec::new(),
            cleanup: None,
        }
    }

    /// Returns the deadline in ms since the Unix epoch.
    pub fn deadline(&self) -> u64 {
        self.start_timestamp.saturating_add(self.expiry_duration)
    }

    /// Returns true once the deadline has passed.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.deadline()
    }

    /// Returns true if a sweeper other than `owner` holds a claim that has
    /// not yet lapsed.
    pub fn is_claimed_by_other(&self, owner: &str, now: u64) -> bool {
        match &self.cleanup {
            Some(claim) => {
                claim.owner != owner
                    && now < claim.claimed_at.saturating_add(self.expiry_duration)
            }
            None => false,
        }
    }

    /// Moves to `next`, rejecting transitions outside the phase graph.
    pub fn transition(&mut self, next: AtrPhase) -> TxnResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(TxnError::InvalidPhaseTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Appends a staged document; only permitted while Pending.
    pub fn record(&mut self, mutation: StagedMutationRef) -> TxnResult<()> {
        if self.phase != AtrPhase::Pending {
            return Err(TxnError::invalid_operation(format!(
                "cannot stage into an ATR entry in phase {:?}",
                self.phase
            )));
        }
        self.mutations.push(mutation);
        Ok(())
    }

    /// Returns the last recorded reference for each document, in the order
    /// documents were first staged.
    pub fn effective_mutations(&self) -> Vec<&StagedMutationRef> {
        let mut order: Vec<&StagedMutationRef> = Vec::new();
        for m in &self.mutations {
            match order
                .iter_mut()
                .find(|seen| seen.document_key == m.document_key && seen.collection == m.collection)
            {
                Some(seen) => *seen = m,
                None => order.push(m),
            }
        }
        order
    }
}

/// Body of an ATR document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtrDocument {
    /// Owning transaction.
    pub transaction_id: TransactionId,
    /// Entries keyed by attempt id.
    pub attempts: BTreeMap<String, AtrEntry>,
}

impl AtrDocument {
    /// Creates a document holding a single entry.
    pub fn with_entry(entry: AtrEntry) -> Self {
        let mut attempts = BTreeMap::new();
        attempts.insert(entry.attempt_id.to_string(), entry.clone());
        Self {
            transaction_id: entry.transaction_id,
            attempts,
        }
    }

    /// Returns the entry of an attempt.
    pub fn entry(&self, attempt_id: AttemptId) -> Option<&AtrEntry> {
        self.attempts.get(&attempt_id.to_string())
    }

    /// Returns the entry of an attempt, mutably.
    pub fn entry_mut(&mut self, attempt_id: AttemptId) -> Option<&mut AtrEntry> {
        self.attempts.get_mut(&attempt_id.to_string())
    }

    /// Returns true if every entry is terminal.
    pub fn is_resolved(&self) -> bool {
        self.attempts.values().all(|e| e.phase.is_terminal())
    }
}

/// Reads and decodes an ATR document.
///
/// Returns `None` if the document does not exist.
pub(crate) fn load<S: DocumentStore + ?Sized>(
    store: &S,
    atr: &AtrRef,
) -> TxnResult<Option<(AtrDocument, Cas)>> {
    let stored = match store.read(&atr.collection, &atr.key) {
        Ok(doc) => doc,
        Err(StoreError::NotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let body = stored
        .content
        .ok_or_else(|| TxnError::atr_corrupt(&atr.key, "ATR has no body"))?;
    let doc: AtrDocument =
        serde_json::from_value(body).map_err(|e| TxnError::atr_corrupt(&atr.key, e.to_string()))?;
    Ok(Some((doc, stored.cas)))
}

/// Reads the entry of one attempt.
#[cfg(test)]
pub(crate) fn load_entry<S: DocumentStore + ?Sized>(
    store: &S,
    atr: &AtrRef,
    attempt_id: AttemptId,
) -> TxnResult<Option<AtrEntry>> {
    Ok(load(store, atr)?.and_then(|(doc, _)| doc.entry(attempt_id).cloned()))
}

/// Writes an ATR document with a single CAS check.
///
/// Raw store errors are returned so callers can tell a lost race
/// ([`StoreError::CasMismatch`]) from other failures.
pub(crate) fn store_document<S: DocumentStore + ?Sized>(
    store: &S,
    atr: &AtrRef,
    doc: &AtrDocument,
    expected: Option<Cas>,
    durability: DurabilityLevel,
) -> TxnResult<Result<Cas, StoreError>> {
    let body =
        serde_json::to_value(doc).map_err(|e| TxnError::atr_corrupt(&atr.key, e.to_string()))?;
    Ok(store.write(
        &atr.collection,
        &atr.key,
        DocumentWrite::body(body).with_durability(durability),
        expected,
    ))
}

/// Adds a new entry, creating the ATR document if needed.
pub(crate) fn add_entry<S: DocumentStore + ?Sized>(
    store: &S,
    atr: &AtrRef,
    entry: &AtrEntry,
    durability: DurabilityLevel,
) -> TxnResult<()> {
    for _ in 0..MAX_ATR_UPDATE_RETRIES {
        let (doc, expected) = match load(store, atr)? {
            Some((mut doc, cas)) => {
                doc.attempts
                    .insert(entry.attempt_id.to_string(), entry.clone());
                (doc, Some(cas))
            }
            None => (AtrDocument::with_entry(entry.clone()), None),
        };

        match store_document(store, atr, &doc, expected, durability)? {
            Ok(_) => return Ok(()),
            Err(StoreError::CasMismatch | StoreError::AlreadyExists | StoreError::NotFound) => {
                continue
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(TxnError::TransientFailure(format!(
        "ATR {} too contended to add an entry",
        atr.key
    )))
}

/// Applies `update` to one attempt's entry, retrying on CAS races.
///
/// `update` is re-run against fresh state after every lost race, so it must
/// validate rather than assume the current phase.
pub(crate) fn mutate_entry<S, F>(
    store: &S,
    atr: &AtrRef,
    attempt_id: AttemptId,
    durability: DurabilityLevel,
    mut update: F,
) -> TxnResult<AtrEntry>
where
    S: DocumentStore + ?Sized,
    F: FnMut(&mut AtrEntry) -> TxnResult<()>,
{
    for _ in 0..MAX_ATR_UPDATE_RETRIES {
        let (mut doc, cas) = load(store, atr)?
            .ok_or_else(|| TxnError::atr_corrupt(&atr.key, "ATR document is missing"))?;
        let entry = doc.entry_mut(attempt_id).ok_or_else(|| {
            TxnError::atr_corrupt(&atr.key, format!("no entry for attempt {attempt_id}"))
        })?;
        update(entry)?;
        let updated = entry.clone();

        match store_document(store, atr, &doc, Some(cas), durability)? {
            Ok(_) => return Ok(updated),
            Err(StoreError::CasMismatch) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(TxnError::TransientFailure(format!(
        "ATR {} too contended to update attempt {attempt_id}",
        atr.key
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use doctxn_store::InMemoryStore;

    fn entry() -> AtrEntry {
        AtrEntry::new(
            TransactionId::new(),
            AttemptId::new(),
            1_000,
            500,
            DurabilityLevel::Majority,
        )
    }

    fn mref(key: &str, op: OperationType) -> StagedMutationRef {
        StagedMutationRef {
            collection: CollectionRef::in_default_scope("c"),
            document_key: key.to_string(),
            operation_type: op,
            cas_before_staging: None,
        }
    }

    fn atr_ref(txn: TransactionId) -> AtrRef {
        AtrRef::for_transaction(&CollectionRef::in_default_scope("_txn_atrs"), txn)
    }

    #[test]
    fn permitted_transitions() {
        use AtrPhase::*;
        assert!(Pending.can_transition_to(Committing));
        assert!(Pending.can_transition_to(Aborting));
        assert!(Committing.can_transition_to(Committed));
        assert!(Aborting.can_transition_to(RolledBack));

        assert!(!Committing.can_transition_to(Aborting));
        assert!(!Committed.can_transition_to(Pending));
        assert!(!RolledBack.can_transition_to(Committing));
        assert!(!Pending.can_transition_to(Committed));
        assert!(!Aborting.can_transition_to(Committing));
    }

    #[test]
    fn transition_rejects_backwards_moves() {
        let mut e = entry();
        e.transition(AtrPhase::Committing).unwrap();
        let err = e.transition(AtrPhase::Aborting).unwrap_err();
        assert!(matches!(err, TxnError::InvalidPhaseTransition { .. }));
        assert_eq!(e.phase, AtrPhase::Committing);
    }

    #[test]
    fn record_only_while_pending() {
        let mut e = entry();
        e.record(mref("a", OperationType::Insert)).unwrap();
        e.transition(AtrPhase::Aborting).unwrap();
        assert!(e.record(mref("b", OperationType::Insert)).is_err());
        assert_eq!(e.mutations.len(), 1);
    }

    #[test]
    fn expiry_and_claims() {
        let mut e = entry();
        assert!(!e.is_expired(1_499));
        assert!(e.is_expired(1_500));

        e.cleanup = Some(CleanupClaim {
            owner: "sweeper-a".into(),
            claimed_at: 2_000,
        });
        assert!(e.is_claimed_by_other("sweeper-b", 2_100));
        assert!(!e.is_claimed_by_other("sweeper-a", 2_100));
        // Claims lapse after one expiry duration
        assert!(!e.is_claimed_by_other("sweeper-b", 2_500));
    }

    #[test]
    fn effective_mutations_keep_last_ref_per_document() {
        let mut e = entry();
        e.record(mref("a", OperationType::Insert)).unwrap();
        e.record(mref("b", OperationType::Replace)).unwrap();
        e.record(mref("a", OperationType::Replace)).unwrap();

        let effective = e.effective_mutations();
        assert_eq!(effective.len(), 2);
        assert_eq!(effective[0].document_key, "a");
        assert_eq!(effective[0].operation_type, OperationType::Replace);
        assert_eq!(effective[1].document_key, "b");
    }

    #[test]
    fn entry_field_names() {
        let mut e = entry();
        e.record(mref("a", OperationType::Remove)).unwrap();
        let value = serde_json::to_value(&e).unwrap();

        for field in [
            "transactionId",
            "attemptId",
            "phase",
            "startTimestamp",
            "expiryDuration",
            "mutations",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert!(value.get("cleanup").is_none());
        let m = &value["mutations"][0];
        assert_eq!(m["documentKey"], "a");
        assert_eq!(m["operationType"], "Remove");
        assert!(m.get("casBeforeStaging").is_some());
    }

    #[test]
    fn add_and_mutate_entries() {
        let store = InMemoryStore::new();
        let first = entry();
        let atr = atr_ref(first.transaction_id);
        assert!(load(&store, &atr).unwrap().is_none());

        add_entry(&store, &atr, &first, DurabilityLevel::Majority).unwrap();

        let mut second = entry();
        second.transaction_id = first.transaction_id;
        add_entry(&store, &atr, &second, DurabilityLevel::Majority).unwrap();

        let (doc, _) = load(&store, &atr).unwrap().unwrap();
        assert_eq!(doc.attempts.len(), 2);

        let updated = mutate_entry(&store, &atr, first.attempt_id, DurabilityLevel::Majority, |e| {
            e.transition(AtrPhase::Aborting)
        })
        .unwrap();
        assert_eq!(updated.phase, AtrPhase::Aborting);

        let reloaded = load_entry(&store, &atr, first.attempt_id).unwrap().unwrap();
        assert_eq!(reloaded.phase, AtrPhase::Aborting);
        let untouched = load_entry(&store, &atr, second.attempt_id).unwrap().unwrap();
        assert_eq!(untouched.phase, AtrPhase::Pending);
    }

    #[test]
    fn mutate_missing_entry_is_corruption() {
        let store = InMemoryStore::new();
        let e = entry();
        let atr = atr_ref(e.transaction_id);
        add_entry(&store, &atr, &e, DurabilityLevel::Majority).unwrap();

        let err = mutate_entry(&store, &atr, AttemptId::new(), DurabilityLevel::Majority, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, TxnError::AtrCorrupt { .. }));
    }

    #[test]
    fn undecodable_atr_is_corruption() {
        let store = InMemoryStore::new();
        let atr = atr_ref(TransactionId::new());
        store.upsert(&atr.collection, &atr.key, serde_json::json!({"nonsense": true}));

        let err = load(&store, &atr).unwrap_err();
        assert!(matches!(err, TxnError::AtrCorrupt { .. }));
    }
}
