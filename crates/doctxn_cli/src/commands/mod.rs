//! CLI command implementations.

pub mod cleanup;
pub mod inspect;
pub mod verify;

use doctxn_core::{AtrDocument, AtrRef, TransactionConfig};
use doctxn_store::{DocumentStore, InMemoryStore};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Loads a snapshot, failing with a readable message if it is missing.
pub fn open_snapshot(path: &Path) -> Result<InMemoryStore, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No snapshot found at {}", path.display()).into());
    }
    Ok(InMemoryStore::load_snapshot(path)?)
}

/// Reads every ATR document in the default metadata collection, sorted by key.
///
/// Records that do not parse are returned as errors alongside their key.
pub fn load_atrs(store: &InMemoryStore) -> Vec<(AtrRef, Result<AtrDocument, String>)> {
    let collection = TransactionConfig::default().metadata_collection;
    let mut keys = store.keys(&collection).unwrap_or_default();
    keys.retain(|k| k.starts_with(AtrRef::KEY_PREFIX));
    keys.sort();

    keys.into_iter()
        .map(|key| {
            let atr = AtrRef {
                collection: collection.clone(),
                key,
            };
            let doc = read_atr(store, &atr);
            (atr, doc)
        })
        .collect()
}

/// Reads and parses one ATR document.
pub fn read_atr(store: &InMemoryStore, atr: &AtrRef) -> Result<AtrDocument, String> {
    let stored = store
        .read(&atr.collection, &atr.key)
        .map_err(|e| e.to_string())?;
    let content = stored.content.ok_or("ATR has no body")?;
    serde_json::from_value(content).map_err(|e| e.to_string())
}

/// Current time in ms since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
