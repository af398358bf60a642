//! Cleanup of abandoned attempts.
//!
//! An attempt whose process died leaves its ATR entry non-terminal and its
//! documents staged, blocking other writers until the entry expires. The
//! sweeper scans the metadata collection for such entries and finishes them:
//!
//! - Pending or Committing entries are committed forward
//! - Aborting entries are rolled back
//!
//! Sweepers coordinate through a claim written into the ATR entry with a
//! CAS-guarded write. Whoever loses the race does nothing further.

use crate::atr::{self, AtrDocument, AtrPhase, AtrRef, CleanupClaim};
use crate::config::TransactionConfig;
use crate::error::{TxnError, TxnResult};
use crate::resolve;
use crate::types::{now_millis, AttemptId};
use doctxn_store::{Cas, CollectionRef, DocumentStore, StoreError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Non-terminal entries looked at.
    pub examined: u64,
    /// Entries committed forward.
    pub committed: u64,
    /// Entries rolled back.
    pub rolled_back: u64,
    /// Entries another sweeper claimed first.
    pub lost_races: u64,
    /// Entries not yet expired, or claimed by another sweeper.
    pub skipped: u64,
    /// ATR documents removed after their grace period.
    pub removed_records: u64,
    /// Entries or documents that could not be processed.
    pub failures: u64,
}

impl CleanupReport {
    /// Returns true if the sweep changed anything or hit errors.
    pub fn has_activity(&self) -> bool {
        self.committed + self.rolled_back + self.removed_records + self.failures > 0
    }
}

/// Outcome of resolving one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Committed,
    RolledBack,
    LostRace,
}

/// Resolves abandoned ATR entries.
pub struct CleanupSweeper<S: DocumentStore> {
    store: Arc<S>,
    metadata_collection: CollectionRef,
    grace_period: Duration,
    owner: String,
}

impl<S: DocumentStore> CleanupSweeper<S> {
    /// Creates a sweeper using the config's metadata collection and grace
    /// period.
    pub fn new(store: Arc<S>, config: &TransactionConfig) -> Self {
        Self {
            store,
            metadata_collection: config.metadata_collection.clone(),
            grace_period: config.cleanup_grace_period,
            owner: format!("sweeper-{}", Uuid::new_v4()),
        }
    }

    /// Sets the id written into claims.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Returns the id written into claims.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Runs one sweep at the current time.
    ///
    /// # Errors
    ///
    /// Returns an error only if the metadata collection cannot be listed;
    /// failures on individual records are counted in the report.
    pub fn sweep_once(&self) -> TxnResult<CleanupReport> {
        self.sweep_at(now_millis())
    }

    /// Runs one sweep as if the clock read `now` (ms since the Unix epoch).
    ///
    /// # Errors
    ///
    /// See [`Self::sweep_once`].
    pub fn sweep_at(&self, now: u64) -> TxnResult<CleanupReport> {
        let mut report = CleanupReport::default();
        let keys = self.store.keys(&self.metadata_collection)?;

        for key in keys.into_iter().filter(|k| k.starts_with(AtrRef::KEY_PREFIX)) {
            let atr = AtrRef {
                collection: self.metadata_collection.clone(),
                key,
            };
            if let Err(e) = self.sweep_record(&atr, now, &mut report) {
                warn!(atr = %atr.key, error = %e, "failed to sweep ATR");
                report.failures += 1;
            }
        }

        if report.has_activity() {
            info!(
                owner = %self.owner,
                committed = report.committed,
                rolled_back = report.rolled_back,
                lost_races = report.lost_races,
                removed = report.removed_records,
                failures = report.failures,
                "cleanup sweep finished"
            );
        } else {
            debug!(owner = %self.owner, examined = report.examined, "cleanup sweep found nothing to do");
        }
        Ok(report)
    }

    fn sweep_record(&self, atr: &AtrRef, now: u64, report: &mut CleanupReport) -> TxnResult<()> {
        let Some((mut doc, mut cas)) = atr::load(self.store.as_ref(), atr)? else {
            return Ok(());
        };
        let attempt_ids: Vec<AttemptId> = doc.attempts.values().map(|e| e.attempt_id).collect();

        for attempt_id in attempt_ids {
            let Some(entry) = doc.entry(attempt_id) else {
                continue;
            };
            if entry.phase.is_terminal() {
                continue;
            }
            report.examined += 1;
            if !entry.is_expired(now) || entry.is_claimed_by_other(&self.owner, now) {
                report.skipped += 1;
                continue;
            }

            match self.resolve_entry(atr, &doc, cas, attempt_id, now) {
                Ok(EntryOutcome::Committed) => report.committed += 1,
                Ok(EntryOutcome::RolledBack) => report.rolled_back += 1,
                Ok(EntryOutcome::LostRace) => report.lost_races += 1,
                Err(e) => {
                    warn!(atr = %atr.key, attempt = %attempt_id, error = %e, "failed to resolve attempt");
                    report.failures += 1;
                }
            }

            // The ATR changed; later entries are judged on fresh state
            match atr::load(self.store.as_ref(), atr)? {
                Some((fresh, fresh_cas)) => {
                    doc = fresh;
                    cas = fresh_cas;
                }
                None => return Ok(()),
            }
        }

        self.remove_if_reclaimable(atr, now, report)
    }

    /// Claims an entry from a previously loaded ATR state, then replays it.
    ///
    /// The claim is a single CAS-guarded write against `cas`; if the ATR
    /// changed since it was loaded, another party got there first.
    fn resolve_entry(
        &self,
        atr: &AtrRef,
        loaded: &AtrDocument,
        cas: Cas,
        attempt_id: AttemptId,
        now: u64,
    ) -> TxnResult<EntryOutcome> {
        let mut doc = loaded.clone();
        let entry = doc
            .entry_mut(attempt_id)
            .ok_or_else(|| TxnError::atr_corrupt(&atr.key, format!("no entry for attempt {attempt_id}")))?;
        entry.cleanup = Some(CleanupClaim {
            owner: self.owner.clone(),
            claimed_at: now,
        });
        if entry.phase == AtrPhase::Pending {
            entry.transition(AtrPhase::Committing)?;
        }
        let phase = entry.phase;
        let durability = entry.durability_level;
        let mutations: Vec<_> = entry
            .effective_mutations()
            .into_iter()
            .cloned()
            .collect();

        match atr::store_document(self.store.as_ref(), atr, &doc, Some(cas), durability)? {
            Ok(_) => {}
            Err(StoreError::CasMismatch | StoreError::NotFound) => {
                debug!(atr = %atr.key, attempt = %attempt_id, owner = %self.owner, "lost claim race");
                return Ok(EntryOutcome::LostRace);
            }
            Err(e) => return Err(e.into()),
        }
        debug!(atr = %atr.key, attempt = %attempt_id, phase = ?phase, owner = %self.owner, "claimed attempt");

        let (target, outcome) = match phase {
            AtrPhase::Committing => {
                for m in &mutations {
                    resolve::commit_document(
                        self.store.as_ref(),
                        &m.collection,
                        &m.document_key,
                        attempt_id,
                        durability,
                    )?;
                }
                (AtrPhase::Committed, EntryOutcome::Committed)
            }
            AtrPhase::Aborting => {
                for m in &mutations {
                    resolve::rollback_document(
                        self.store.as_ref(),
                        &m.collection,
                        &m.document_key,
                        attempt_id,
                        durability,
                    )?;
                }
                (AtrPhase::RolledBack, EntryOutcome::RolledBack)
            }
            other => {
                return Err(TxnError::atr_corrupt(
                    &atr.key,
                    format!("cannot clean up an attempt in phase {other:?}"),
                ))
            }
        };

        atr::mutate_entry(self.store.as_ref(), atr, attempt_id, durability, |e| {
            if e.phase == target {
                Ok(())
            } else {
                e.transition(target)
            }
        })?;
        info!(atr = %atr.key, attempt = %attempt_id, phase = ?target, documents = mutations.len(), "cleaned up attempt");
        Ok(outcome)
    }

    /// Removes the ATR document once every entry is terminal and the grace
    /// period after the last deadline has passed.
    fn remove_if_reclaimable(&self, atr: &AtrRef, now: u64, report: &mut CleanupReport) -> TxnResult<()> {
        let Some((doc, cas)) = atr::load(self.store.as_ref(), atr)? else {
            return Ok(());
        };
        if !doc.is_resolved() {
            return Ok(());
        }
        let grace = self.grace_period.as_millis() as u64;
        let reclaimable_at = doc
            .attempts
            .values()
            .map(|e| e.deadline().saturating_add(grace))
            .max()
            .unwrap_or(0);
        if now < reclaimable_at {
            return Ok(());
        }

        let durability = doc
            .attempts
            .values()
            .map(|e| e.durability_level)
            .max()
            .unwrap_or_default();
        match self.store.remove(&atr.collection, &atr.key, cas, durability) {
            Ok(()) => {
                debug!(atr = %atr.key, "removed resolved ATR");
                report.removed_records += 1;
                Ok(())
            }
            Err(StoreError::CasMismatch | StoreError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl<S: DocumentStore + 'static> CleanupSweeper<S> {
    /// Runs sweeps every `poll_interval` on a tokio task.
    ///
    /// Each sweep runs on the blocking pool. Must be called within a tokio
    /// runtime.
    pub fn spawn(self, poll_interval: Duration) -> CleanupHandle {
        let sweeper = Arc::new(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let period = poll_interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(owner = %sweeper.owner, ?period, "cleanup sweeper started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let s = Arc::clone(&sweeper);
                        match tokio::task::spawn_blocking(move || s.sweep_once()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!(error = %e, "cleanup sweep failed"),
                            Err(e) => warn!(error = %e, "cleanup sweep task panicked"),
                        }
                    }
                }
            }
            info!(owner = %sweeper.owner, "cleanup sweeper stopped");
        });

        CleanupHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Handle to a running background sweeper.
pub struct CleanupHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Signals shutdown and waits for any in-flight sweep to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            // The task may already be gone
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "cleanup task ended abnormally");
        }
    }

    /// Returns true once the background task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::{AtrEntry, StagedMutationRef};
    use crate::metadata::TransactionMetadata;
    use crate::staged::OperationType;
    use crate::types::TransactionId;
    use doctxn_store::{DocumentWrite, DurabilityLevel, InMemoryStore};
    use serde_json::json;

    const START: u64 = 1_000_000;
    const EXPIRY: u64 = 1_000;

    fn users() -> CollectionRef {
        CollectionRef::in_default_scope("users")
    }

    fn config() -> TransactionConfig {
        TransactionConfig::new().with_cleanup_grace_period(Duration::from_millis(500))
    }

    /// Writes an abandoned attempt that staged an insert of `key`.
    fn abandon(store: &InMemoryStore, key: &str, phase: AtrPhase) -> (AtrRef, AttemptId) {
        let txn = TransactionId::new();
        let mut entry = AtrEntry::new(txn, AttemptId::new(), START, EXPIRY, DurabilityLevel::Majority);
        entry
            .record(StagedMutationRef {
                collection: users(),
                document_key: key.to_string(),
                operation_type: OperationType::Insert,
                cas_before_staging: None,
            })
            .unwrap();
        if phase != AtrPhase::Pending {
            entry.transition(phase).unwrap();
        }
        let atr = AtrRef::for_transaction(&config().metadata_collection, txn);
        atr::add_entry(store, &atr, &entry, DurabilityLevel::Majority).unwrap();

        let xattrs = TransactionMetadata {
            txn_id: txn,
            attempt_id: entry.attempt_id,
            operation_type: OperationType::Insert,
            atr_ref: atr.clone(),
            staged_content: Some(json!({"k": key})),
        }
        .into_xattrs(None)
        .unwrap();
        store
            .write(&users(), key, DocumentWrite::shadow(xattrs), None)
            .unwrap();
        (atr, entry.attempt_id)
    }

    #[test]
    fn live_entries_are_skipped() {
        let store = Arc::new(InMemoryStore::new());
        abandon(&store, "k", AtrPhase::Pending);
        let sweeper = CleanupSweeper::new(Arc::clone(&store), &config());

        let report = sweeper.sweep_at(START + EXPIRY - 1).unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.get(&users(), "k"), None);
    }

    #[test]
    fn expired_pending_is_committed_forward() {
        let store = Arc::new(InMemoryStore::new());
        let (atr, attempt) = abandon(&store, "k", AtrPhase::Pending);
        let sweeper = CleanupSweeper::new(Arc::clone(&store), &config());

        let report = sweeper.sweep_at(START + EXPIRY).unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(store.get(&users(), "k"), Some(json!({"k": "k"})));

        let entry = atr::load_entry(store.as_ref(), &atr, attempt).unwrap().unwrap();
        assert_eq!(entry.phase, AtrPhase::Committed);
        assert_eq!(entry.cleanup.unwrap().owner, sweeper.owner());
    }

    #[test]
    fn expired_aborting_is_rolled_back() {
        let store = Arc::new(InMemoryStore::new());
        abandon(&store, "k", AtrPhase::Aborting);
        let sweeper = CleanupSweeper::new(Arc::clone(&store), &config());

        let report = sweeper.sweep_at(START + EXPIRY).unwrap();
        assert_eq!(report.rolled_back, 1);
        assert!(store.read(&users(), "k").is_err());
    }

    #[test]
    fn stale_claim_loses_race_without_side_effects() {
        let store = Arc::new(InMemoryStore::new());
        let (atr, attempt) = abandon(&store, "k", AtrPhase::Pending);
        let a = CleanupSweeper::new(Arc::clone(&store), &config()).with_owner("a");
        let b = CleanupSweeper::new(Arc::clone(&store), &config()).with_owner("b");

        // Both load the same ATR state; a finishes first
        let (stale, stale_cas) = atr::load(store.as_ref(), &atr).unwrap().unwrap();
        assert_eq!(a.sweep_at(START + EXPIRY).unwrap().committed, 1);

        let mutations = store.mutation_count();
        let outcome = b.resolve_entry(&atr, &stale, stale_cas, attempt, START + EXPIRY).unwrap();
        assert_eq!(outcome, EntryOutcome::LostRace);
        assert_eq!(store.mutation_count(), mutations);
    }

    #[test]
    fn claimed_entries_are_left_to_their_owner() {
        let store = Arc::new(InMemoryStore::new());
        let (atr, attempt) = abandon(&store, "k", AtrPhase::Aborting);
        atr::mutate_entry(store.as_ref(), &atr, attempt, DurabilityLevel::Majority, |e| {
            e.cleanup = Some(CleanupClaim {
                owner: "other".into(),
                claimed_at: START + EXPIRY,
            });
            Ok(())
        })
        .unwrap();

        let sweeper = CleanupSweeper::new(Arc::clone(&store), &config());
        let report = sweeper.sweep_at(START + EXPIRY + 1).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.rolled_back, 0);

        // The claim lapses after one expiry duration
        let report = sweeper.sweep_at(START + 2 * EXPIRY).unwrap();
        assert_eq!(report.rolled_back, 1);
    }

    #[test]
    fn resolved_records_removed_after_grace() {
        let store = Arc::new(InMemoryStore::new());
        let (atr, _) = abandon(&store, "k", AtrPhase::Pending);
        let sweeper = CleanupSweeper::new(Arc::clone(&store), &config());

        let report = sweeper.sweep_at(START + EXPIRY).unwrap();
        assert_eq!(report.removed_records, 0);
        assert!(atr::load(store.as_ref(), &atr).unwrap().is_some());

        let report = sweeper.sweep_at(START + EXPIRY + 500).unwrap();
        assert_eq!(report.removed_records, 1);
        assert_eq!(report.examined, 0);
        assert!(atr::load(store.as_ref(), &atr).unwrap().is_none());
    }

    #[test]
    fn corrupt_records_are_counted() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert(&config().metadata_collection, "atr-broken", json!([1, 2]));
        let sweeper = CleanupSweeper::new(Arc::clone(&store), &config());

        let report = sweeper.sweep_at(START).unwrap();
        assert_eq!(report.failures, 1);
    }

    #[tokio::test]
    async fn background_sweeper_starts_and_stops() {
        let store = Arc::new(InMemoryStore::new());
        abandon(&store, "k", AtrPhase::Pending);
        let handle = CleanupSweeper::new(Arc::clone(&store), &config()).spawn(Duration::from_millis(10));

        for _ in 0..100 {
            if store.get(&users(), "k").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;
        assert_eq!(store.get(&users(), "k"), Some(json!({"k": "k"})));
    }
}
