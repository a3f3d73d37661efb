//! Retry policy and backoff calculation

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_millis;
use crate::error::ItemError;

/// Fraction of the computed delay used as the jitter range (±25%)
pub const JITTER_FACTOR: f64 = 0.25;

const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Configuration for item retries
///
/// Supports exponential backoff with jitter to avoid thundering herd.
///
/// # Example
///
/// ```
/// use everruns_batch::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new()
///     .with_max_retries(4)
///     .with_initial_backoff(Duration::from_millis(100))
///     .with_max_backoff(Duration::from_secs(2));
///
/// // First retry after ~100ms
/// // Second retry after ~200ms
/// // Third retry after ~400ms
/// // etc., each ±25%
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once)
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,

    /// Maximum delay between retries, before jitter
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,

    /// Backoff multiplier (non-positive values fall back to 2.0)
    pub backoff_multiplier: f64,

    /// Errors that may be retried. Empty means every error is retryable.
    #[serde(skip)]
    pub retryable_errors: Vec<RetryableError>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: DEFAULT_MULTIPLIER,
            retryable_errors: vec![],
        }
    }
}

impl RetryPolicy {
    /// Create a policy that runs each item once
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an exponential policy with the given retry count and first delay
    pub fn exponential(max_retries: u32, initial_backoff: Duration) -> Self {
        Self::default()
            .with_max_retries(max_retries)
            .with_initial_backoff(initial_backoff)
    }

    /// Set the number of retries after the first attempt
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the cap on the computed delay
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Restrict retries to errors matching `matcher`
    ///
    /// Once any matcher is registered, only matching errors are retried.
    pub fn with_retryable_error(mut self, matcher: RetryableError) -> Self {
        self.retryable_errors.push(matcher);
        self
    }

    /// Total attempts per item, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Multiplier actually used for backoff
    pub fn effective_multiplier(&self) -> f64 {
        if self.backoff_multiplier.is_finite() && self.backoff_multiplier > 0.0 {
            self.backoff_multiplier
        } else {
            DEFAULT_MULTIPLIER
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    ///
    /// `initial_backoff * multiplier^attempt`, capped at `max_backoff`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.initial_backoff.as_secs_f64() * self.effective_multiplier().powi(exponent);
        let capped = raw.clamp(0.0, self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(capped)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Delay before retry number `attempt` (0-based), with ±25% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        if base == 0.0 {
            return Duration::ZERO;
        }

        let offset = rand::thread_rng().gen_range(-JITTER_FACTOR..=JITTER_FACTOR);
        Duration::try_from_secs_f64((base * (1.0 + offset)).max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Check if an error may be retried
    pub fn is_retryable(&self, error: &ItemError) -> bool {
        if error.is_circuit_open() || matches!(error, ItemError::Panicked(_)) {
            return false;
        }
        self.retryable_errors.is_empty()
            || self.retryable_errors.iter().any(|m| m.matches(error))
    }
}

type Matcher = Arc<dyn Fn(&ItemError) -> bool + Send + Sync>;

/// Matcher for errors that may be retried
///
/// # Example
///
/// ```
/// use everruns_batch::{ItemError, RetryableError};
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("rate limited")]
/// struct RateLimited;
///
/// let matcher = RetryableError::of::<RateLimited>();
/// let err = ItemError::from(anyhow::Error::new(RateLimited).context("calling provider"));
/// assert!(matcher.matches(&err));
/// ```
#[derive(Clone)]
pub struct RetryableError {
    name: String,
    matcher: Matcher,
}

impl RetryableError {
    /// Match failures whose source chain contains an `E`
    pub fn of<E>() -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            name: std::any::type_name::<E>().to_string(),
            matcher: Arc::new(|error: &ItemError| match error {
                ItemError::Failed(err) => err.chain().any(|cause| cause.is::<E>()),
                _ => false,
            }),
        }
    }

    /// Match attempts that hit the item deadline
    pub fn timeout() -> Self {
        Self::matching("timeout", ItemError::is_timeout)
    }

    /// Match with an arbitrary predicate
    pub fn matching<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ItemError) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            matcher: Arc::new(predicate),
        }
    }

    /// Name used in debug output
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether `error` matches
    pub fn matches(&self, error: &ItemError) -> bool {
        (self.matcher)(error)
    }
}

impl fmt::Debug for RetryableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RetryableError").field(&self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("connection reset")]
    struct ConnectionReset;

    #[derive(Debug, thiserror::Error)]
    #[error("invalid payload")]
    struct InvalidPayload;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert!(policy.retryable_errors.is_empty());
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(500));

        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay(3), Duration::from_millis(500));
        assert_eq!(policy.base_delay(60), Duration::from_millis(500));
    }

    #[test]
    fn test_multiplier_fallback() {
        for bad in [0.0, -1.5, f64::NAN, f64::INFINITY] {
            let policy = RetryPolicy::exponential(3, Duration::from_millis(10))
                .with_backoff_multiplier(bad);
            assert_eq!(policy.effective_multiplier(), 2.0);
            assert_eq!(policy.base_delay(2), Duration::from_millis(40));
        }

        let policy =
            RetryPolicy::exponential(3, Duration::from_millis(10)).with_backoff_multiplier(3.0);
        assert_eq!(policy.base_delay(2), Duration::from_millis(90));
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(300));

        for attempt in 0..6 {
            let base = policy.base_delay(attempt).as_secs_f64();
            for _ in 0..200 {
                let delay = policy.backoff(attempt).as_secs_f64();
                assert!(delay >= base * (1.0 - JITTER_FACTOR) - 1e-9);
                assert!(delay <= base * (1.0 + JITTER_FACTOR) + 1e-9);
            }
        }
    }

    #[test]
    fn test_huge_max_backoff_saturates() {
        let policy = RetryPolicy::exponential(80, Duration::from_secs(1))
            .with_max_backoff(Duration::MAX);

        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(70), Duration::MAX);
        assert_eq!(policy.base_delay(u32::MAX), Duration::MAX);
        for attempt in [63, 64, 70, 1000, u32::MAX] {
            assert!(policy.backoff(attempt) >= Duration::from_secs(1 << 62));
        }
    }

    #[test]
    fn test_zero_backoff_has_no_jitter() {
        let policy = RetryPolicy::exponential(3, Duration::ZERO);
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(2), Duration::ZERO);
    }

    #[test]
    fn test_everything_retryable_without_allow_list() {
        let policy = RetryPolicy::exponential(2, Duration::from_millis(1));
        assert!(policy.is_retryable(&ItemError::from(anyhow::anyhow!("boom"))));
        assert!(policy.is_retryable(&ItemError::Timeout));
        assert!(!policy.is_retryable(&ItemError::CircuitOpen));
        assert!(!policy.is_retryable(&ItemError::Panicked("boom".into())));
    }

    #[test]
    fn test_allow_list_matches_wrapped_errors() {
        let policy = RetryPolicy::exponential(2, Duration::from_millis(1))
            .with_retryable_error(RetryableError::of::<ConnectionReset>());

        let wrapped = ItemError::from(anyhow::Error::new(ConnectionReset).context("fetching page"));
        assert!(policy.is_retryable(&wrapped));

        let other = ItemError::from(anyhow::Error::new(InvalidPayload));
        assert!(!policy.is_retryable(&other));
        assert!(!policy.is_retryable(&ItemError::Timeout));
    }

    #[test]
    fn test_timeout_matcher() {
        let policy = RetryPolicy::exponential(2, Duration::from_millis(1))
            .with_retryable_error(RetryableError::timeout());
        assert!(policy.is_retryable(&ItemError::Timeout));
        assert!(!policy.is_retryable(&ItemError::from(anyhow::anyhow!("boom"))));
    }

    #[test]
    fn test_serialization_skips_matchers() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(250))
            .with_retryable_error(RetryableError::timeout());

        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["initial_backoff"], 250);
        assert!(json.get("retryable_errors").is_none());

        let parsed: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.max_retries, 3);
        assert!(parsed.retryable_errors.is_empty());
    }

    #[test]
    fn test_debug_shows_matcher_names() {
        let matcher = RetryableError::matching("rate-limit", |_| true);
        assert_eq!(format!("{:?}", matcher), "RetryableError(\"rate-limit\")");
    }
}
