//! Cleanup command implementation.

use super::{now_millis, open_snapshot};
use doctxn_core::{CleanupReport, CleanupSweeper, TransactionConfig};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Runs the cleanup command.
///
/// The sweep runs against the loaded snapshot; the result is written back to
/// the same file unless `dry_run` is set.
pub fn run(path: &Path, dry_run: bool, now_ms: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(open_snapshot(path)?);
    let now = now_ms.unwrap_or_else(now_millis);

    let sweeper = CleanupSweeper::new(Arc::clone(&store), &TransactionConfig::default())
        .with_owner("doctxn-cli");
    let report = sweeper.sweep_at(now)?;
    print_report(&report);

    if dry_run {
        println!();
        println!("Dry run - snapshot not modified");
        return Ok(());
    }
    if report.has_activity() {
        store.save_snapshot(path)?;
        info!(path = %path.display(), "wrote cleaned snapshot");
    }
    Ok(())
}

fn print_report(report: &CleanupReport) {
    println!("Cleanup Results:");
    println!("  Attempts examined:   {}", report.examined);
    println!("  Committed forward:   {}", report.committed);
    println!("  Rolled back:         {}", report.rolled_back);
    println!("  Skipped (live):      {}", report.skipped);
    println!("  Lost races:          {}", report.lost_races);
    println!("  Records removed:     {}", report.removed_records);
    println!("  Failures:            {}", report.failures);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::verify::verify;
    use doctxn_core::Transactions;
    use doctxn_store::{CollectionRef, InMemoryStore};
    use serde_json::json;
    use tempfile::TempDir;

    fn staged_snapshot(dir: &TempDir) -> std::path::PathBuf {
        let store = Arc::new(InMemoryStore::new());
        let users = CollectionRef::in_default_scope("users");
        store.upsert(&users, "a", json!({"v": 0}));
        let txns = Transactions::new(Arc::clone(&store), TransactionConfig::default());

        let mut ctx = txns.begin_attempt();
        ctx.replace(&users, "a", json!({"v": 1})).unwrap();
        drop(ctx);

        let path = dir.path().join("store.snapshot");
        store.save_snapshot(&path).unwrap();
        path
    }

    #[test]
    fn cleanup_writes_snapshot_back() {
        let dir = TempDir::new().unwrap();
        let path = staged_snapshot(&dir);

        run(&path, false, Some(u64::MAX / 2)).unwrap();

        let store = InMemoryStore::load_snapshot(&path).unwrap();
        let users = CollectionRef::in_default_scope("users");
        assert_eq!(store.get(&users, "a"), Some(json!({"v": 1})));
        assert!(verify(&store, u64::MAX).is_ok());
    }

    #[test]
    fn dry_run_leaves_snapshot_untouched() {
        let dir = TempDir::new().unwrap();
        let path = staged_snapshot(&dir);
        let before = std::fs::read(&path).unwrap();

        run(&path, true, Some(u64::MAX / 2)).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), before);
    }
}
