//! Batch processor configuration
//!
//! Configuration can be built in code with the `with_*` builders or loaded
//! from environment variables with [`BatchConfig::from_env`].

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::BatchError;
use crate::reliability::{CircuitBreakerConfig, RetryPolicy};

/// Configuration for a [`BatchProcessor`](crate::BatchProcessor)
///
/// # Example
///
/// ```
/// use everruns_batch::BatchConfig;
/// use std::time::Duration;
///
/// let config = BatchConfig::new()
///     .with_name("embeddings")
///     .with_max_concurrency(8)
///     .with_item_timeout(Duration::from_secs(10))
///     .with_retry(3, Duration::from_millis(200))
///     .with_circuit_breaker(5, Duration::from_secs(30))
///     .with_backpressure_threshold(1_000);
///
/// assert_eq!(config.max_concurrency, 8);
/// assert_eq!(config.retry.max_retries, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Name reported to the metrics sink
    pub name: String,

    /// Maximum work-function invocations running at once, shared across batches
    pub max_concurrency: usize,

    /// Deadline for a single attempt of the work function
    #[serde(with = "duration_millis")]
    pub item_timeout: Duration,

    /// Deadline for a whole top-level call
    #[serde(with = "duration_millis")]
    pub batch_timeout: Duration,

    /// Retry policy applied to every item
    pub retry: RetryPolicy,

    /// Circuit breaker (None = disabled)
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Maximum items admitted but not yet completed (0 = disabled)
    pub backpressure_threshold: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            name: "batch".to_string(),
            max_concurrency: default_concurrency(),
            item_timeout: Duration::from_secs(30),
            batch_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            circuit_breaker: None,
            backpressure_threshold: 0,
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl BatchConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables (all optional):
    /// - `BATCH_NAME`: Name reported in metrics (default: batch)
    /// - `BATCH_MAX_CONCURRENCY`: Concurrent invocations (default: CPU count)
    /// - `BATCH_ITEM_TIMEOUT_MS`: Per-attempt timeout (default: 30000)
    /// - `BATCH_BATCH_TIMEOUT_MS`: Per-call timeout (default: 300000)
    /// - `BATCH_MAX_RETRIES`: Retries after the first attempt (default: 0)
    /// - `BATCH_INITIAL_BACKOFF_MS`: First retry delay (default: 100)
    /// - `BATCH_MAX_BACKOFF_MS`: Retry delay cap (default: 30000)
    /// - `BATCH_BACKOFF_MULTIPLIER`: Growth factor (default: 2.0)
    /// - `BATCH_CIRCUIT_BREAKER_THRESHOLD`: Failures to open the breaker (default: disabled)
    /// - `BATCH_CIRCUIT_BREAKER_RESET_MS`: Open duration before probing (default: 30000)
    /// - `BATCH_BACKPRESSURE_THRESHOLD`: Pending item limit (default: disabled)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = env::var("BATCH_NAME") {
            config = config.with_name(name);
        }
        if let Some(n) = env_parse::<usize>("BATCH_MAX_CONCURRENCY") {
            config = config.with_max_concurrency(n);
        }
        if let Some(ms) = env_parse::<u64>("BATCH_ITEM_TIMEOUT_MS") {
            config = config.with_item_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("BATCH_BATCH_TIMEOUT_MS") {
            config = config.with_batch_timeout(Duration::from_millis(ms));
        }

        let mut retry = config.retry.clone();
        if let Some(n) = env_parse::<u32>("BATCH_MAX_RETRIES") {
            retry = retry.with_max_retries(n);
        }
        if let Some(ms) = env_parse::<u64>("BATCH_INITIAL_BACKOFF_MS") {
            retry = retry.with_initial_backoff(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("BATCH_MAX_BACKOFF_MS") {
            retry = retry.with_max_backoff(Duration::from_millis(ms));
        }
        if let Some(m) = env_parse::<f64>("BATCH_BACKOFF_MULTIPLIER") {
            retry = retry.with_backoff_multiplier(m);
        }
        config = config.with_retry_policy(retry);

        if let Some(threshold) = env_parse::<u32>("BATCH_CIRCUIT_BREAKER_THRESHOLD") {
            let reset = env_parse::<u64>("BATCH_CIRCUIT_BREAKER_RESET_MS")
                .map(Duration::from_millis)
                .unwrap_or_else(|| CircuitBreakerConfig::default().reset_timeout);
            config = config.with_circuit_breaker(threshold, reset);
        }
        if let Some(n) = env_parse::<usize>("BATCH_BACKPRESSURE_THRESHOLD") {
            config = config.with_backpressure_threshold(n);
        }

        config
    }

    /// Set the name reported to the metrics sink
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set maximum concurrency (ignored when zero)
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        if max > 0 {
            self.max_concurrency = max;
        }
        self
    }

    /// Set the per-attempt timeout (ignored when zero)
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.item_timeout = timeout;
        }
        self
    }

    /// Set the per-call timeout (ignored when zero)
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.batch_timeout = timeout;
        }
        self
    }

    /// Set the retry count and initial backoff, keeping the other policy fields
    pub fn with_retry(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.retry = self
            .retry
            .with_max_retries(max_retries)
            .with_initial_backoff(initial_backoff);
        self
    }

    /// Replace the whole retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Enable the circuit breaker (ignored when either argument is zero)
    pub fn with_circuit_breaker(mut self, failure_threshold: u32, reset_timeout: Duration) -> Self {
        if failure_threshold > 0 && !reset_timeout.is_zero() {
            self.circuit_breaker = Some(
                CircuitBreakerConfig::new()
                    .with_failure_threshold(failure_threshold)
                    .with_reset_timeout(reset_timeout),
            );
        }
        self
    }

    /// Set the pending-item limit (ignored when zero)
    pub fn with_backpressure_threshold(mut self, threshold: usize) -> Self {
        if threshold > 0 {
            self.backpressure_threshold = threshold;
        }
        self
    }

    /// Validate the configuration
    ///
    /// Builders never produce an invalid config; this catches values that
    /// arrived through deserialization.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.max_concurrency == 0 {
            return Err(BatchError::InvalidInput(
                "max_concurrency must be greater than zero".into(),
            ));
        }
        if self.max_concurrency > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(BatchError::InvalidInput(format!(
                "max_concurrency must not exceed {}",
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        if self.item_timeout.is_zero() {
            return Err(BatchError::InvalidInput(
                "item_timeout must be greater than zero".into(),
            ));
        }
        if self.batch_timeout.is_zero() {
            return Err(BatchError::InvalidInput(
                "batch_timeout must be greater than zero".into(),
            ));
        }
        if let Some(breaker) = &self.circuit_breaker {
            if breaker.failure_threshold > 0 && breaker.reset_timeout.is_zero() {
                return Err(BatchError::InvalidInput(
                    "circuit breaker reset_timeout must be greater than zero".into(),
                ));
            }
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
