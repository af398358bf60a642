//! Configuration for transactions and cleanup.

use doctxn_store::{CollectionRef, DurabilityLevel};
use std::time::Duration;

/// Collection holding ATR documents unless configured otherwise.
pub const DEFAULT_METADATA_COLLECTION: &str = "_txn_atrs";

/// Configuration shared by every transaction run through a
/// [`crate::Transactions`] instance.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Total time budget of a transaction, across all attempts.
    pub timeout: Duration,
    /// Durability applied to every staging, unstaging and ATR write.
    pub durability_level: DurabilityLevel,
    /// How often the background sweeper scans for abandoned attempts.
    pub cleanup_poll_interval: Duration,
    /// How long fully resolved ATR documents are kept before removal.
    pub cleanup_grace_period: Duration,
    /// Collection holding ATR documents.
    pub metadata_collection: CollectionRef,
    /// Maximum number of attempts per transaction; `None` means the
    /// timeout is the only budget.
    pub max_attempts: Option<u32>,
    /// Backoff between attempts.
    pub retry: RetryConfig,
}

impl TransactionConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            durability_level: DurabilityLevel::Majority,
            cleanup_poll_interval: Duration::from_secs(60),
            cleanup_grace_period: Duration::from_secs(60),
            metadata_collection: CollectionRef::in_default_scope(DEFAULT_METADATA_COLLECTION),
            max_attempts: None,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the transaction timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the durability level.
    pub fn with_durability_level(mut self, level: DurabilityLevel) -> Self {
        self.durability_level = level;
        self
    }

    /// Sets the cleanup poll interval.
    pub fn with_cleanup_poll_interval(mut self, interval: Duration) -> Self {
        self.cleanup_poll_interval = interval;
        self
    }

    /// Sets the grace period before resolved ATRs are removed.
    pub fn with_cleanup_grace_period(mut self, grace: Duration) -> Self {
        self.cleanup_grace_period = grace;
        self
    }

    /// Sets the collection holding ATR documents.
    pub fn with_metadata_collection(mut self, collection: CollectionRef) -> Self {
        self.metadata_collection = collection;
        self
    }

    /// Caps the number of attempts per transaction.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Sets the retry backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-transaction overrides of [`TransactionConfig`].
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Overrides the timeout.
    pub timeout: Option<Duration>,
    /// Overrides the durability level.
    pub durability_level: Option<DurabilityLevel>,
}

impl TransactionOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the durability level.
    pub fn with_durability_level(mut self, level: DurabilityLevel) -> Self {
        self.durability_level = Some(level);
        self
    }
}

/// Settings in force for one transaction.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub timeout: Duration,
    pub durability: DurabilityLevel,
    pub metadata_collection: CollectionRef,
}

impl ResolvedOptions {
    pub fn resolve(config: &TransactionConfig, options: &TransactionOptions) -> Self {
        Self {
            timeout: options.timeout.unwrap_or(config.timeout),
            durability: options.durability_level.unwrap_or(config.durability_level),
            metadata_collection: config.metadata_collection.clone(),
        }
    }
}

/// Backoff applied by the transaction runner before retrying an attempt
/// that failed with a retryable error such as a write-write conflict.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the second attempt of a transaction.
    pub initial_delay: Duration,
    /// Upper bound on the delay between two attempts of one transaction.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter so conflicting transactions do not retry in
    /// lockstep.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration with the given initial delay.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that retries immediately.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Delay the runner sleeps before starting attempt number `attempt`
    /// (0-indexed; the first attempt starts immediately).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Add up to 25% jitter
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

/// Pseudo-random factor in `[0, 1)` derived from the clock, spreading out
/// retries of transactions that conflicted on the same documents.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_config_builder() {
        let config = TransactionConfig::new()
            .with_timeout(Duration::from_secs(2))
            .with_durability_level(DurabilityLevel::None)
            .with_cleanup_poll_interval(Duration::from_millis(250))
            .with_metadata_collection(CollectionRef::new("meta", "atrs"))
            .with_max_attempts(0);

        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.durability_level, DurabilityLevel::None);
        assert_eq!(config.cleanup_poll_interval, Duration::from_millis(250));
        assert_eq!(config.metadata_collection.to_string(), "meta.atrs");
        // At least one attempt is always allowed
        assert_eq!(config.max_attempts, Some(1));
    }

    #[test]
    fn defaults() {
        let config = TransactionConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.durability_level, DurabilityLevel::Majority);
        assert_eq!(config.metadata_collection.collection, DEFAULT_METADATA_COLLECTION);
        assert!(config.max_attempts.is_none());
    }

    #[test]
    fn options_override_config() {
        let config = TransactionConfig::new();
        let resolved = ResolvedOptions::resolve(
            &config,
            &TransactionOptions::new()
                .with_timeout(Duration::from_millis(10))
                .with_durability_level(DurabilityLevel::PersistToMajority),
        );
        assert_eq!(resolved.timeout, Duration::from_millis(10));
        assert_eq!(resolved.durability, DurabilityLevel::PersistToMajority);

        let resolved = ResolvedOptions::resolve(&config, &TransactionOptions::default());
        assert_eq!(resolved.timeout, config.timeout);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(Duration::from_millis(10))
            .with_max_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(10));
        assert!(delay1 <= Duration::from_millis(13)); // with jitter

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(20));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(Duration::from_millis(50))
            .with_max_delay(Duration::from_millis(80))
            .with_backoff_multiplier(10.0)
            .without_jitter();

        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(80));
        assert_eq!(RetryConfig::immediate().delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_the_capped_delay() {
        let config = RetryConfig::new(Duration::from_millis(40))
            .with_max_delay(Duration::from_millis(40));

        for attempt in 1..20 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay >= Duration::from_millis(40));
            assert!(delay <= Duration::from_millis(50));
        }
        let factor = rand_jitter();
        assert!((0.0..1.0).contains(&factor));
    }
}
