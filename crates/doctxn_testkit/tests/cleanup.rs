//! Crash recovery through the cleanup sweeper.

use doctxn_core::{AtrPhase, CleanupSweeper, TransactionOptions, TxnError};
use doctxn_store::{DocumentStore, InMemoryStore};
use doctxn_testkit::prelude::*;
use serde_json::json;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A clock reading well past any test transaction's deadline.
fn far_future() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    now + 3_600_000
}

fn sweeper<S: DocumentStore + 'static>(store: &Arc<S>) -> CleanupSweeper<S> {
    CleanupSweeper::new(Arc::clone(store), &fast_config())
}

#[test]
fn abandoned_pending_attempt_is_committed_forward() {
    let store = seeded_store(&[("k2", json!({"b": 0}))]);
    let txns = transactions(&store);

    let mut ctx = txns.begin_attempt();
    ctx.insert(&users(), "k1", json!({"a": 1})).unwrap();
    ctx.replace(&users(), "k2", json!({"b": 2})).unwrap();
    drop(ctx);

    // Nothing happens before the deadline
    let report = sweeper(&store).sweep_once().unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(store.get(&users(), "k2"), Some(json!({"b": 0})));

    let report = sweeper(&store).sweep_at(far_future()).unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(report.removed_records, 1);
    assert_eq!(store.get(&users(), "k1"), Some(json!({"a": 1})));
    assert_eq!(store.get(&users(), "k2"), Some(json!({"b": 2})));
    assert!(atr_keys(store.as_ref()).is_empty());
}

#[test]
fn crash_mid_commit_is_finished_by_sweeper() {
    let store = Arc::new(FaultInjectingStore::new(InMemoryStore::new()));
    store.inner().upsert(&users(), "k2", json!({"b": 0}));
    let txns = transactions(&store);

    let mut ctx = txns.begin_attempt();
    ctx.insert(&users(), "k1", json!({"a": 1})).unwrap();
    ctx.replace(&users(), "k2", json!({"b": 2})).unwrap();

    // Committing transition and the first unstage succeed, then the process dies
    store.crash_after_writes(2);
    let err = ctx.commit().unwrap_err();
    assert!(matches!(err, TxnError::Store(_)));
    assert_eq!(ctx.phase(), AtrPhase::Committing);
    drop(ctx);

    store.reset();
    assert_eq!(store.inner().get(&users(), "k1"), Some(json!({"a": 1})));
    assert_eq!(store.inner().get(&users(), "k2"), Some(json!({"b": 0})));

    let report = sweeper(&store).sweep_at(far_future()).unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(report.failures, 0);
    assert_eq!(store.inner().get(&users(), "k1"), Some(json!({"a": 1})));
    assert_eq!(store.inner().get(&users(), "k2"), Some(json!({"b": 2})));
}

#[test]
fn resumed_commit_is_idempotent() {
    let store = Arc::new(FaultInjectingStore::new(InMemoryStore::new()));
    let txns = transactions(&store);

    let mut ctx = txns.begin_attempt();
    ctx.insert(&users(), "a", json!(1)).unwrap();
    ctx.insert(&users(), "b", json!(2)).unwrap();

    store.crash_after_writes(2);
    assert!(ctx.commit().is_err());
    store.reset();

    let before = store.mutation_count();
    ctx.commit().unwrap();
    assert_eq!(ctx.phase(), AtrPhase::Committed);
    // Only the remaining document and the final ATR transition were written
    assert_eq!(store.mutation_count(), before + 2);
    assert_eq!(store.inner().get(&users(), "a"), Some(json!(1)));
    assert_eq!(store.inner().get(&users(), "b"), Some(json!(2)));

    let report = sweeper(&store).sweep_at(far_future()).unwrap();
    assert_eq!(report.committed + report.rolled_back, 0);
}

#[test]
fn crash_mid_rollback_is_finished_by_sweeper() {
    let store = Arc::new(FaultInjectingStore::new(InMemoryStore::new()));
    store.inner().upsert(&users(), "k1", json!({"a": 0}));
    store.inner().upsert(&users(), "k2", json!({"b": 0}));
    let txns = transactions(&store);

    let mut ctx = txns.begin_attempt();
    ctx.replace(&users(), "k1", json!({"a": 1})).unwrap();
    ctx.replace(&users(), "k2", json!({"b": 1})).unwrap();
    ctx.insert(&users(), "k3", json!({"c": 1})).unwrap();

    store.crash_after_writes(2);
    assert!(ctx.rollback().is_err());
    assert_eq!(ctx.phase(), AtrPhase::Aborting);
    drop(ctx);
    store.reset();

    let report = sweeper(&store).sweep_at(far_future()).unwrap();
    assert_eq!(report.rolled_back, 1);

    let inner = store.inner();
    assert_eq!(inner.get(&users(), "k1"), Some(json!({"a": 0})));
    assert_eq!(inner.get(&users(), "k2"), Some(json!({"b": 0})));
    assert!(inner.read(&users(), "k3").is_err());
    for key in ["k1", "k2"] {
        assert!(inner.read(&users(), key).unwrap().xattrs.is_none());
    }
}

#[test]
fn repeated_sweeps_have_no_further_effect() {
    let store = seeded_store(&[]);
    let txns = transactions(&store);

    let mut ctx = txns.begin_attempt();
    ctx.insert(&users(), "k", json!(1)).unwrap();
    drop(ctx);

    let sweeper = sweeper(&store);
    assert_eq!(sweeper.sweep_at(far_future()).unwrap().committed, 1);

    let mutations = store.mutation_count();
    let report = sweeper.sweep_at(far_future()).unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(store.mutation_count(), mutations);
}

#[test]
fn concurrent_sweepers_resolve_once() {
    let store = seeded_store(&[("k2", json!({"b": 0}))]);
    let txns = transactions(&store);

    let mut ctx = txns.begin_attempt();
    ctx.insert(&users(), "k1", json!({"a": 1})).unwrap();
    ctx.replace(&users(), "k2", json!({"b": 2})).unwrap();
    drop(ctx);

    let before = store.mutation_count();
    let now = far_future();
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = ["sweeper-a", "sweeper-b"]
        .into_iter()
        .map(|owner| {
            let sweeper = sweeper(&store).with_owner(owner);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                sweeper.sweep_at(now).unwrap()
            })
        })
        .collect();
    let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(reports.iter().map(|r| r.committed).sum::<u64>(), 1);
    assert_eq!(reports.iter().map(|r| r.failures).sum::<u64>(), 0);
    // claim + two unstages + Committed + ATR removal, whoever won
    assert_eq!(store.mutation_count(), before + 5);
    assert_eq!(store.get(&users(), "k1"), Some(json!({"a": 1})));
    assert_eq!(store.get(&users(), "k2"), Some(json!({"b": 2})));
}

/// Options whose deadline passes almost immediately.
fn short_lived() -> TransactionOptions {
    TransactionOptions::new().with_timeout(Duration::from_millis(20))
}

#[test]
fn expired_staging_does_not_block_new_transactions() {
    let store = seeded_store(&[("k", json!({"v": 0}))]);
    let txns = transactions(&store);

    let mut abandoned = txns.begin_attempt_with_options(&short_lived());
    abandoned.replace(&users(), "k", json!({"v": 1})).unwrap();
    drop(abandoned);
    thread::sleep(Duration::from_millis(30));

    // The abandoned attempt is taken over, so its staging is ignored
    txns.run(|ctx| {
        let current = ctx.get(&users(), "k")?;
        assert_eq!(current.content, json!({"v": 0}));
        ctx.replace(&users(), "k", json!({"v": 7}))?;
        Ok(())
    })
    .unwrap();

    let report = sweeper(&store).sweep_at(far_future()).unwrap();
    assert_eq!(report.rolled_back, 1);
    assert_eq!(report.committed, 0);
    assert_eq!(store.get(&users(), "k"), Some(json!({"v": 7})));
}

#[test]
fn reader_of_expired_pending_transfer_agrees_with_cleanup() {
    let store = seeded_store(&[("a", json!({"v": 100})), ("b", json!({"v": 0}))]);
    let txns = transactions(&store);

    let mut abandoned = txns.begin_attempt_with_options(&short_lived());
    abandoned.replace(&users(), "a", json!({"v": 90})).unwrap();
    abandoned.replace(&users(), "b", json!({"v": 10})).unwrap();
    drop(abandoned);
    thread::sleep(Duration::from_millis(30));

    txns.run(|ctx| {
        let b = ctx.get(&users(), "b")?;
        assert_eq!(b.content, json!({"v": 0}));
        ctx.replace(&users(), "b", json!({"v": 1}))?;
        Ok(())
    })
    .unwrap();

    // Cleanup rolls the transfer back instead of applying half of it
    let report = sweeper(&store).sweep_at(far_future()).unwrap();
    assert_eq!(report.rolled_back, 1);
    assert_eq!(report.committed, 0);
    assert_eq!(store.get(&users(), "a"), Some(json!({"v": 100})));
    assert_eq!(store.get(&users(), "b"), Some(json!({"v": 1})));
    for key in ["a", "b"] {
        assert!(store.read(&users(), key).unwrap().xattrs.is_none());
    }
}

#[test]
fn reader_of_expired_committing_transfer_sees_committed_content() {
    let store = Arc::new(FaultInjectingStore::new(InMemoryStore::new()));
    store.inner().upsert(&users(), "a", json!({"v": 0}));
    store.inner().upsert(&users(), "b", json!({"v": 0}));
    let txns = transactions(&store);

    let mut crashed = txns.begin_attempt_with_options(&short_lived());
    crashed.replace(&users(), "a", json!({"v": 10})).unwrap();
    crashed.replace(&users(), "b", json!({"v": 10})).unwrap();
    // Past the commit point with only `a` unstaged
    store.crash_after_writes(2);
    assert!(crashed.commit().is_err());
    assert_eq!(crashed.phase(), AtrPhase::Committing);
    drop(crashed);
    store.reset();
    thread::sleep(Duration::from_millis(30));

    txns.run(|ctx| {
        let b = ctx.get(&users(), "b")?;
        assert_eq!(b.content, json!({"v": 10}));
        let v = b.content["v"].as_i64().unwrap_or_default();
        ctx.replace(&users(), "b", json!({"v": v + 5}))?;
        Ok(())
    })
    .unwrap();

    let report = sweeper(&store).sweep_at(far_future()).unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(report.failures, 0);
    assert_eq!(store.inner().get(&users(), "a"), Some(json!({"v": 10})));
    assert_eq!(store.inner().get(&users(), "b"), Some(json!({"v": 15})));
}

#[test]
fn snapshot_round_trip_keeps_staging() {
    let store = seeded_store(&[("k", json!({"v": 0}))]);
    let txns = transactions(&store);

    let mut ctx = txns.begin_attempt();
    ctx.replace(&users(), "k", json!({"v": 1})).unwrap();
    drop(ctx);

    let snapshot = TempSnapshot::of(&store).unwrap();
    let restored = Arc::new(snapshot.load().unwrap());
    assert_eq!(restored.get(&users(), "k"), Some(json!({"v": 0})));
    assert_eq!(atr_keys(restored.as_ref()).len(), 1);

    let report = sweeper(&restored).sweep_at(far_future()).unwrap();
    assert_eq!(report.committed, 1);
    assert_eq!(restored.get(&users(), "k"), Some(json!({"v": 1})));
}

#[tokio::test]
async fn background_cleanup_runs_until_closed() {
    let store = seeded_store(&[]);
    let txns = transactions(&store);

    let mut abandoned = txns.begin_attempt_with_options(&short_lived());
    abandoned.insert(&users(), "k", json!(1)).unwrap();
    drop(abandoned);

    txns.start_cleanup();
    assert!(txns.is_cleanup_running());

    for _ in 0..200 {
        if store.get(&users(), "k").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    txns.close().await;

    assert!(!txns.is_cleanup_running());
    assert_eq!(store.get(&users(), "k"), Some(json!(1)));
}
