//! Concurrent stress helpers.
//!
//! These run many conflicting transactions at once and report how they ended,
//! so tests can check that atomicity holds under contention.

use doctxn_core::{TransactionConfig, Transactions, TxnError};
use doctxn_store::{CollectionRef, DocumentStore, InMemoryStore};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Transactions attempted.
    pub transactions: usize,
    /// Transactions that committed.
    pub committed: usize,
    /// Transactions that failed or expired.
    pub failed: usize,
    /// Attempts across all transactions.
    pub attempts: usize,
    /// Wall time of the run.
    pub duration: Duration,
}

/// Configuration for transfer stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent threads.
    pub threads: usize,
    /// Transfers per thread.
    pub transfers_per_thread: usize,
    /// Number of accounts transfers move between.
    pub accounts: usize,
    /// Starting balance of every account.
    pub initial_balance: i64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            transfers_per_thread: 25,
            accounts: 4,
            initial_balance: 100,
        }
    }
}

/// Key of the `i`th account.
pub fn account_key(i: usize) -> String {
    format!("acct-{i}")
}

/// Creates the accounts in `collection`.
pub fn seed_accounts(store: &InMemoryStore, collection: &CollectionRef, config: &StressConfig) {
    for i in 0..config.accounts {
        store.upsert(collection, &account_key(i), json!({"balance": config.initial_balance}));
    }
}

/// Sums the `balance` field of every account.
pub fn total_balance<S: DocumentStore>(store: &S, collection: &CollectionRef, accounts: usize) -> i64 {
    (0..accounts)
        .filter_map(|i| store.read(collection, &account_key(i)).ok())
        .filter_map(|doc| doc.content)
        .filter_map(|content| content["balance"].as_i64())
        .sum()
}

/// Runs concurrent transfers between accounts.
///
/// Each transfer moves one unit from one account to another in a single
/// transaction, so the total balance is invariant whatever interleaving
/// occurs.
pub fn stress_transfers(
    store: Arc<InMemoryStore>,
    collection: &CollectionRef,
    config: &StressConfig,
    txn_config: TransactionConfig,
) -> StressTestResult {
    let txns = Arc::new(Transactions::new(store, txn_config));
    let committed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let txns = Arc::clone(&txns);
            let committed = Arc::clone(&committed);
            let failed = Arc::clone(&failed);
            let attempts = Arc::clone(&attempts);
            let collection = collection.clone();
            let config = config.clone();

            thread::spawn(move || {
                for i in 0..config.transfers_per_thread {
                    let from = account_key((t + i) % config.accounts);
                    let to = account_key((t + i + 1 + t % 2) % config.accounts);
                    if from == to {
                        continue;
                    }

                    let result = txns.run(|ctx| {
                        let source = ctx.get(&collection, &from)?;
                        let target = ctx.get(&collection, &to)?;
                        let balance = |doc: &serde_json::Value| {
                            doc["balance"]
                                .as_i64()
                                .ok_or_else(|| TxnError::invalid_operation("balance is not a number"))
                        };
                        let source_balance = balance(&source.content)?;
                        let target_balance = balance(&target.content)?;
                        ctx.replace(&collection, &from, json!({"balance": source_balance - 1}))?;
                        ctx.replace(&collection, &to, json!({"balance": target_balance + 1}))?;
                        Ok(())
                    });

                    match result {
                        Ok(r) => {
                            committed.fetch_add(1, Ordering::SeqCst);
                            attempts.fetch_add(r.attempts as usize, Ordering::SeqCst);
                        }
                        Err(f) => {
                            failed.fetch_add(1, Ordering::SeqCst);
                            attempts.fetch_add(f.result.attempts as usize, Ordering::SeqCst);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }

    let committed = committed.load(Ordering::SeqCst);
    let failed = failed.load(Ordering::SeqCst);
    StressTestResult {
        transactions: committed + failed,
        committed,
        failed,
        attempts: attempts.load(Ordering::SeqCst),
        duration: start.elapsed(),
    }
}
