//! Verify command implementation.

use super::{now_millis, open_snapshot, read_atr};
use doctxn_core::{AtrPhase, TransactionConfig, TransactionMetadata};
use doctxn_store::{CollectionRef, DocumentStore, InMemoryStore};
use std::fmt;
use std::path::Path;

/// Why a staged document is considered orphaned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanReason {
    /// The ATR document or its entry for the attempt is gone.
    MissingEntry,
    /// The attempt reached a terminal phase but left metadata behind.
    Terminal(AtrPhase),
    /// The attempt's deadline passed before it finished.
    Expired(AtrPhase),
    /// The metadata itself does not parse.
    Malformed(String),
}

impl fmt::Display for OrphanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrphanReason::MissingEntry => write!(f, "ATR entry missing"),
            OrphanReason::Terminal(phase) => write!(f, "attempt already {phase:?}"),
            OrphanReason::Expired(phase) => write!(f, "attempt expired while {phase:?}"),
            OrphanReason::Malformed(e) => write!(f, "malformed metadata: {e}"),
        }
    }
}

/// A document carrying staging metadata from a dead attempt.
#[derive(Debug, Clone)]
pub struct Orphan {
    /// Collection of the document.
    pub collection: CollectionRef,
    /// Document key.
    pub key: String,
    /// Classification.
    pub reason: OrphanReason,
}

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Documents checked.
    pub documents_checked: usize,
    /// Documents staged by attempts that are still live.
    pub live_staged: usize,
    /// Documents staged by dead attempts.
    pub orphans: Vec<Orphan>,
}

impl VerifyResult {
    /// Returns true if no orphaned staging was found.
    pub fn is_ok(&self) -> bool {
        self.orphans.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying snapshot at {}", path.display());
    println!();

    let store = open_snapshot(path)?;
    let result = verify(&store, now_millis());

    println!("Documents checked:   {}", result.documents_checked);
    println!("Staged by live txns: {}", result.live_staged);
    println!("Orphaned staging:    {}", result.orphans.len());
    for orphan in &result.orphans {
        println!("  {} {}: {}", orphan.collection, orphan.key, orphan.reason);
    }

    println!();
    if result.is_ok() {
        println!("✓ Snapshot verification passed");
        Ok(())
    } else {
        println!("✗ Snapshot verification failed; run `doctxn cleanup` to resolve");
        Err("Verification failed".into())
    }
}

/// Classifies every staged document in `store` as of `now`.
pub fn verify(store: &InMemoryStore, now: u64) -> VerifyResult {
    let metadata_collection = TransactionConfig::default().metadata_collection;
    let mut result = VerifyResult::default();

    for collection in store.collections() {
        if collection == metadata_collection {
            continue;
        }
        for key in store.keys(&collection).unwrap_or_default() {
            let Ok(doc) = store.read(&collection, &key) else {
                continue;
            };
            result.documents_checked += 1;

            let reason = match TransactionMetadata::from_xattrs(doc.xattrs.as_ref()) {
                Ok(None) => continue,
                Ok(Some(meta)) => classify(store, &meta, now),
                Err(e) => Some(OrphanReason::Malformed(e.to_string())),
            };
            match reason {
                None => result.live_staged += 1,
                Some(reason) => result.orphans.push(Orphan {
                    collection: collection.clone(),
                    key,
                    reason,
                }),
            }
        }
    }

    result
}

fn classify(store: &InMemoryStore, meta: &TransactionMetadata, now: u64) -> Option<OrphanReason> {
    let entry = read_atr(store, &meta.atr_ref)
        .ok()
        .and_then(|atr| atr.entry(meta.attempt_id).cloned());
    match entry {
        None => Some(OrphanReason::MissingEntry),
        Some(entry) if entry.phase.is_terminal() => Some(OrphanReason::Terminal(entry.phase)),
        Some(entry) if entry.is_expired(now) => Some(OrphanReason::Expired(entry.phase)),
        Some(_) => None,
    }
}
