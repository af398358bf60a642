//! Transaction orchestrator.
//!
//! Runs user logic once per attempt until an attempt commits, the logic asks
//! for a rollback, a fatal error occurs, or the transaction's time (or attempt)
//! budget runs out.

use crate::atr::AtrPhase;
use crate::attempt::AttemptContext;
use crate::cleanup::{CleanupHandle, CleanupSweeper};
use crate::config::{ResolvedOptions, TransactionConfig, TransactionOptions};
use crate::error::{TransactionFailed, TxnError, TxnResult};
use crate::types::{now_millis, AttemptId, TransactionId};
use doctxn_store::DocumentStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How an attempt ended.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The commit point was passed.
    Success {
        /// Whether every staged document was unstaged.
        unstaging_complete: bool,
    },
    /// User logic rolled the attempt back.
    RolledBack,
    /// A conflict or transient failure; a fresh attempt may succeed.
    Retryable(TxnError),
    /// An error that retrying cannot fix.
    Fatal(TxnError),
    /// The transaction deadline passed.
    Expired,
}

impl AttemptOutcome {
    /// Returns the outcome without its cause.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            AttemptOutcome::Success { .. } => OutcomeKind::Success,
            AttemptOutcome::RolledBack => OutcomeKind::RolledBack,
            AttemptOutcome::Retryable(_) => OutcomeKind::Retryable,
            AttemptOutcome::Fatal(_) => OutcomeKind::Fatal,
            AttemptOutcome::Expired => OutcomeKind::Expired,
        }
    }
}

/// [`AttemptOutcome`] without its cause, as kept in the attempt log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// See [`AttemptOutcome::Success`].
    Success,
    /// See [`AttemptOutcome::RolledBack`].
    RolledBack,
    /// See [`AttemptOutcome::Retryable`].
    Retryable,
    /// See [`AttemptOutcome::Fatal`].
    Fatal,
    /// See [`AttemptOutcome::Expired`].
    Expired,
}

/// Record of one attempt.
#[derive(Debug, Clone)]
pub struct AttemptLog {
    /// Attempt id.
    pub attempt_id: AttemptId,
    /// How the attempt ended.
    pub outcome: OutcomeKind,
    /// Error that ended the attempt, if any.
    pub cause: Option<String>,
    /// Phase the attempt finished in.
    pub phase: AtrPhase,
    /// Time spent in the attempt.
    pub elapsed: Duration,
}

/// Final state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalState {
    /// Changes are durable (possibly still being unstaged).
    Committed,
    /// User logic rolled back; no changes were made.
    RolledBack,
    /// A fatal error, or the attempt budget was exhausted.
    Failed,
    /// The timeout elapsed before an attempt committed.
    Expired,
}

/// Summary of a transaction.
#[derive(Debug, Clone)]
pub struct TransactionResult {
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Number of attempts made.
    pub attempts: u32,
    /// Final state.
    pub final_state: FinalState,
    /// False if the transaction committed but some documents are left for
    /// the cleanup sweeper to unstage.
    pub unstaging_complete: bool,
    /// One entry per attempt, oldest first.
    pub logs: Vec<AttemptLog>,
}

/// Entry point for running transactions against a store.
///
/// # Example
///
/// ```rust
/// use doctxn_core::{TransactionConfig, Transactions};
/// use doctxn_store::{CollectionRef, InMemoryStore};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let store = Arc::new(InMemoryStore::new());
/// let txns = Transactions::new(Arc::clone(&store), TransactionConfig::default());
/// let users = CollectionRef::in_default_scope("users");
///
/// let result = txns
///     .run(|ctx| {
///         ctx.insert(&users, "alice", json!({"balance": 10}))?;
///         Ok(())
///     })
///     .unwrap();
/// assert_eq!(result.attempts, 1);
/// assert_eq!(store.get(&users, "alice"), Some(json!({"balance": 10})));
/// ```
pub struct Transactions<S: DocumentStore + 'static> {
    store: Arc<S>,
    config: TransactionConfig,
    cleanup: Mutex<Option<CleanupHandle>>,
}

impl<S: DocumentStore + 'static> Transactions<S> {
    /// Creates an orchestrator over `store`.
    pub fn new(store: Arc<S>, config: TransactionConfig) -> Self {
        Self {
            store,
            config,
            cleanup: Mutex::new(None),
        }
    }

    /// Returns the store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Runs a transaction with the configured defaults.
    ///
    /// `logic` is invoked once per attempt and must be safe to re-run. It
    /// need not call commit; the attempt is committed when it returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionFailed`] if the transaction failed or expired.
    pub fn run<F>(&self, logic: F) -> Result<TransactionResult, TransactionFailed>
    where
        F: FnMut(&mut AttemptContext<'_, S>) -> TxnResult<()>,
    {
        self.run_with_options(TransactionOptions::default(), logic)
    }

    /// Runs a transaction with per-transaction overrides.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionFailed`] if the transaction failed or expired.
    pub fn run_with_options<F>(
        &self,
        options: TransactionOptions,
        mut logic: F,
    ) -> Result<TransactionResult, TransactionFailed>
    where
        F: FnMut(&mut AttemptContext<'_, S>) -> TxnResult<()>,
    {
        let resolved = ResolvedOptions::resolve(&self.config, &options);
        let transaction_id = TransactionId::new();
        let deadline = Instant::now() + resolved.timeout;
        let start_timestamp = now_millis();
        let mut logs: Vec<AttemptLog> = Vec::new();
        let mut last_cause: Option<TxnError> = None;

        debug!(txn = %transaction_id, timeout = ?resolved.timeout, "transaction started");

        loop {
            let attempts = logs.len() as u32;
            if Instant::now() >= deadline {
                info!(txn = %transaction_id, attempts, "transaction expired");
                return Err(failed(transaction_id, logs, FinalState::Expired, TxnError::Expired));
            }
            if self.config.max_attempts.is_some_and(|max| attempts >= max) {
                let cause = last_cause.unwrap_or_else(|| {
                    TxnError::invalid_operation("attempt budget exhausted")
                });
                warn!(txn = %transaction_id, attempts, "attempt budget exhausted");
                return Err(failed(transaction_id, logs, FinalState::Failed, cause));
            }

            let started = Instant::now();
            let mut ctx = AttemptContext::new(
                self.store.as_ref(),
                transaction_id,
                resolved.clone(),
                deadline,
                start_timestamp,
            );
            let outcome = run_attempt(&mut ctx, &mut logic);
            let cause = match &outcome {
                AttemptOutcome::Retryable(e) | AttemptOutcome::Fatal(e) => Some(e.to_string()),
                AttemptOutcome::Expired => Some(TxnError::Expired.to_string()),
                _ => None,
            };
            logs.push(AttemptLog {
                attempt_id: ctx.attempt_id(),
                outcome: outcome.kind(),
                cause,
                phase: ctx.phase(),
                elapsed: started.elapsed(),
            });

            match outcome {
                AttemptOutcome::Success { unstaging_complete } => {
                    return Ok(TransactionResult {
                        transaction_id,
                        attempts: logs.len() as u32,
                        final_state: FinalState::Committed,
                        unstaging_complete,
                        logs,
                    });
                }
                AttemptOutcome::RolledBack => {
                    info!(txn = %transaction_id, "transaction rolled back by application");
                    return Ok(TransactionResult {
                        transaction_id,
                        attempts: logs.len() as u32,
                        final_state: FinalState::RolledBack,
                        unstaging_complete: true,
                        logs,
                    });
                }
                AttemptOutcome::Fatal(err) => {
                    warn!(txn = %transaction_id, error = %err, "transaction failed");
                    return Err(failed(transaction_id, logs, FinalState::Failed, err));
                }
                AttemptOutcome::Expired => {
                    info!(txn = %transaction_id, "transaction expired");
                    return Err(failed(transaction_id, logs, FinalState::Expired, TxnError::Expired));
                }
                AttemptOutcome::Retryable(err) => {
                    debug!(txn = %transaction_id, attempt = logs.len(), error = %err, "retrying transaction");
                    last_cause = Some(err);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let delay = self
                        .config
                        .retry
                        .delay_for_attempt(logs.len() as u32)
                        .min(remaining);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            }
        }
    }

    /// Starts a standalone attempt under a fresh transaction.
    ///
    /// The caller drives the attempt and must call
    /// [`AttemptContext::commit`] or [`AttemptContext::rollback`]; an attempt
    /// dropped without either is left to the cleanup sweeper.
    pub fn begin_attempt(&self) -> AttemptContext<'_, S> {
        self.begin_attempt_with_options(&TransactionOptions::default())
    }

    /// Starts a standalone attempt with per-transaction overrides.
    pub fn begin_attempt_with_options(&self, options: &TransactionOptions) -> AttemptContext<'_, S> {
        let resolved = ResolvedOptions::resolve(&self.config, options);
        let deadline = Instant::now() + resolved.timeout;
        AttemptContext::new(
            self.store.as_ref(),
            TransactionId::new(),
            resolved,
            deadline,
            now_millis(),
        )
    }

    /// Returns a sweeper over this orchestrator's store and metadata
    /// collection.
    pub fn cleanup_sweeper(&self) -> CleanupSweeper<S> {
        CleanupSweeper::new(Arc::clone(&self.store), &self.config)
    }

    /// Starts the background cleanup sweeper if it is not running.
    ///
    /// Must be called within a tokio runtime.
    pub fn start_cleanup(&self) {
        let mut cleanup = self.cleanup.lock();
        if cleanup.is_none() {
            *cleanup = Some(self.cleanup_sweeper().spawn(self.config.cleanup_poll_interval));
        }
    }

    /// Returns true while the background sweeper runs.
    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup.lock().is_some()
    }

    /// Stops the background sweeper, waiting for an in-flight sweep.
    pub async fn close(&self) {
        let handle = self.cleanup.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }
}

/// Runs user logic and commits, classifying the result.
fn run_attempt<S, F>(ctx: &mut AttemptContext<'_, S>, logic: &mut F) -> AttemptOutcome
where
    S: DocumentStore + ?Sized,
    F: FnMut(&mut AttemptContext<'_, S>) -> TxnResult<()>,
{
    let result = logic(ctx).and_then(|()| match ctx.phase() {
        AtrPhase::Pending | AtrPhase::Committing => ctx.commit(),
        _ => Ok(()),
    });

    match result {
        Ok(()) => match ctx.phase() {
            AtrPhase::Committed => AttemptOutcome::Success {
                unstaging_complete: true,
            },
            AtrPhase::RolledBack => AttemptOutcome::RolledBack,
            other => AttemptOutcome::Fatal(TxnError::invalid_operation(format!(
                "attempt finished in phase {other:?}"
            ))),
        },
        Err(err) => classify_failure(ctx, err),
    }
}

fn classify_failure<S: DocumentStore + ?Sized>(
    ctx: &mut AttemptContext<'_, S>,
    err: TxnError,
) -> AttemptOutcome {
    if ctx.phase().is_past_commit_point() {
        let unstaging_complete = ctx.phase() == AtrPhase::Committed;
        if !unstaging_complete {
            warn!(
                txn = %ctx.transaction_id(),
                attempt = %ctx.attempt_id(),
                error = %err,
                "failure after the commit point; cleanup will finish unstaging"
            );
        }
        return AttemptOutcome::Success { unstaging_complete };
    }

    if let Err(rollback_err) = ctx.rollback() {
        warn!(
            txn = %ctx.transaction_id(),
            attempt = %ctx.attempt_id(),
            error = %rollback_err,
            "rollback failed; cleanup will resolve the attempt"
        );
    }

    if err.is_expired() {
        AttemptOutcome::Expired
    } else if err.is_retryable() {
        AttemptOutcome::Retryable(err)
    } else {
        AttemptOutcome::Fatal(err)
    }
}

fn failed(
    transaction_id: TransactionId,
    logs: Vec<AttemptLog>,
    final_state: FinalState,
    cause: TxnError,
) -> TransactionFailed {
    TransactionFailed {
        result: TransactionResult {
            transaction_id,
            attempts: logs.len() as u32,
            final_state,
            unstaging_complete: true,
            logs,
        },
        cause,
    }
}
