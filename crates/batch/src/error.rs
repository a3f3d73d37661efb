//! Error types for batch execution
//!
//! Two layers of failure exist:
//! - [`BatchError`] - admission failures that reject a whole call before any work starts
//! - [`ItemError`] - per-item failures recorded inside each [`ItemResult`](crate::ItemResult)

use std::time::Duration;

use crate::engine::ItemStatus;

/// Errors returned by a top-level batch call or by shutdown
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// Invalid configuration or input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The processor is shutting down and no longer accepts batches
    #[error("batch processor is shutting down")]
    Shutdown,

    /// Admitting the batch would exceed the pending-item threshold
    #[error("backpressure: {pending} pending + {requested} requested exceeds threshold {threshold}")]
    Backpressure {
        pending: usize,
        requested: usize,
        threshold: usize,
    },

    /// Shutdown gave up waiting for in-flight batches
    #[error("graceful shutdown timed out after {0:?} with {1} batch(es) still running")]
    ShutdownTimeout(Duration, usize),
}

impl BatchError {
    /// True for [`BatchError::Shutdown`]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// True for [`BatchError::Backpressure`]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::Backpressure { .. })
    }
}

/// Failure of a single item
///
/// Work functions return `anyhow::Result`, which lands in [`ItemError::Failed`]
/// untouched so callers can downcast to their own error types. A work function
/// may also return one of the marker variants (directly or wrapped with
/// context) to report a timeout or cancellation it observed itself.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    /// The circuit breaker rejected the item without running it
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The item or batch deadline elapsed
    #[error("deadline exceeded")]
    Timeout,

    /// The caller cancelled the batch
    #[error("cancelled")]
    Cancelled,

    /// The work function panicked
    #[error("work function panicked: {0}")]
    Panicked(String),

    /// The work function returned an error
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ItemError {
    /// True when the breaker rejected the item
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen)
    }

    /// True when the error is, or wraps, a deadline condition
    pub fn is_timeout(&self) -> bool {
        self.status() == ItemStatus::Timeout
    }

    /// True when the error is, or wraps, a cancellation
    pub fn is_cancelled(&self) -> bool {
        self.status() == ItemStatus::Cancelled
    }

    /// Terminal status an item ends in when this is its last error
    pub fn status(&self) -> ItemStatus {
        match self {
            Self::Timeout => ItemStatus::Timeout,
            Self::Cancelled => ItemStatus::Cancelled,
            Self::CircuitOpen | Self::Panicked(_) => ItemStatus::Failed,
            Self::Failed(err) => {
                for cause in err.chain() {
                    if cause.is::<tokio::time::error::Elapsed>() {
                        return ItemStatus::Timeout;
                    }
                    match cause.downcast_ref::<ItemError>() {
                        Some(Self::Timeout) => return ItemStatus::Timeout,
                        Some(Self::Cancelled) => return ItemStatus::Cancelled,
                        _ => {}
                    }
                }
                ItemStatus::Failed
            }
        }
    }
}
