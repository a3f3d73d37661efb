//! Per-item execution: breaker gate, retry loop and item timeout

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::scope::{Interrupt, Scope};
use crate::error::ItemError;
use crate::reliability::{CircuitBreaker, RetryPolicy};

/// Terminal status of one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// The work function returned a value
    Success,
    /// The work function failed, panicked, or the breaker rejected the item
    Failed,
    /// The item or batch deadline elapsed
    Timeout,
    /// The caller cancelled the batch
    Cancelled,
}

impl ItemStatus {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one item
///
/// Exactly one of `result` and `error` is set.
#[derive(Debug)]
pub struct ItemResult<R> {
    /// Position of the item in the submitted batch
    pub index: usize,

    /// Value returned by the work function on success
    pub result: Option<R>,

    /// Last error seen for the item
    pub error: Option<ItemError>,

    /// Time from the item starting (after acquiring its slot) to its outcome
    pub duration: Duration,

    /// Terminal status
    pub status: ItemStatus,

    /// Number of times the work function was invoked
    pub attempts: u32,
}

impl<R> ItemResult<R> {
    pub(crate) fn success(index: usize, value: R, duration: Duration, attempts: u32) -> Self {
        Self {
            index,
            result: Some(value),
            error: None,
            duration,
            status: ItemStatus::Success,
            attempts,
        }
    }

    pub(crate) fn failure(index: usize, error: ItemError, duration: Duration, attempts: u32) -> Self {
        Self {
            index,
            result: None,
            status: error.status(),
            error: Some(error),
            duration,
            attempts,
        }
    }

    /// Item that never reached the work function
    pub(crate) fn interrupted(index: usize, interrupt: Interrupt) -> Self {
        Self::failure(index, interrupt.into(), Duration::ZERO, 0)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Duration in whole milliseconds
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    /// Convert into a plain `Result`
    pub fn into_result(self) -> Result<R, ItemError> {
        match (self.result, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(error)) => Err(error),
            (None, None) => Err(ItemError::Cancelled),
        }
    }
}

/// Context handed to the work function on every attempt
///
/// The token is cancelled when the attempt's deadline elapses, when the
/// batch is cancelled, and right after the attempt returns. Work that spawns
/// its own tasks should watch it.
#[derive(Debug, Clone)]
pub struct ItemContext {
    /// Position of the item in the submitted batch
    pub index: usize,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    token: CancellationToken,
}

impl ItemContext {
    pub(crate) fn new(index: usize, attempt: u32, max_attempts: u32, token: CancellationToken) -> Self {
        Self {
            index,
            attempt,
            max_attempts,
            token,
        }
    }

    /// Cancellation token scoped to this attempt
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the attempt is cancelled or times out
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Runs the work function for single items
///
/// One runner is built per batch call and shared by all of its tasks.
pub(crate) struct ItemRunner<F> {
    work: F,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    item_timeout: Duration,
}

impl<F> ItemRunner<F> {
    pub(crate) fn new(
        work: F,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        item_timeout: Duration,
    ) -> Self {
        Self {
            work,
            breaker,
            retry,
            item_timeout,
        }
    }

    pub(crate) async fn run<T, R, Fut>(&self, index: usize, item: T, scope: &Scope) -> ItemResult<R>
    where
        F: Fn(ItemContext, T) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
        T: Clone,
    {
        let started = Instant::now();
        if let Some(interrupt) = scope.check() {
            return ItemResult::interrupted(index, interrupt);
        }
        if !self.breaker.allow() {
            return ItemResult::failure(index, ItemError::CircuitOpen, started.elapsed(), 0);
        }

        let max_attempts = self.retry.max_attempts();
        let mut attempts = 0;
        let mut last_error = ItemError::Cancelled;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.retry.backoff(attempt - 2);
                let interrupted = tokio::select! {
                    biased;
                    interrupt = scope.done() => Some(interrupt),
                    _ = tokio::time::sleep(delay) => None,
                };
                if let Some(interrupt) = interrupted.or_else(|| scope.check()) {
                    last_error = interrupt.into();
                    break;
                }
            }

            attempts = attempt;
            let item_scope = scope.child(self.item_timeout);
            let ctx = ItemContext::new(index, attempt, max_attempts, item_scope.token().clone());
            let input = item.clone();
            let work = AssertUnwindSafe(async move { (self.work)(ctx, input).await }).catch_unwind();

            let outcome = tokio::select! {
                biased;
                outcome = work => match outcome {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(ItemError::Failed(err)),
                    Err(panic) => Err(ItemError::Panicked(panic_message(panic.as_ref()))),
                },
                interrupt = item_scope.done() => Err(interrupt.into()),
            };
            item_scope.cancel();

            match outcome {
                Ok(value) => {
                    self.breaker.record_success();
                    return ItemResult::success(index, value, started.elapsed(), attempts);
                }
                Err(error) => {
                    self.breaker.record_failure();
                    let retry = attempt < max_attempts && self.retry.is_retryable(&error);
                    last_error = error;
                    if !retry {
                        break;
                    }
                }
            }
        }

        ItemResult::failure(index, last_error, started.elapsed(), attempts)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
