//! # Batch Processing Engine
//!
//! A generic, in-process executor that runs a caller-supplied async function
//! over a batch of items.
//!
//! ## Features
//!
//! - **Bounded concurrency**: a semaphore shared by every call on a processor
//! - **Timeouts**: per-item and per-batch deadlines layered on caller cancellation
//! - **Automatic retries**: exponential backoff with ±25% jitter
//! - **Circuit breaker**: lock-free, shared across batches, single half-open probe
//! - **Priority dispatch**: highest priority first, ties in submission order
//! - **Backpressure**: all-or-nothing admission against a pending-item threshold
//! - **Graceful shutdown**: stop admitting and drain in-flight calls
//!
//! Results always come back in submission order, with aggregate counts.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      BatchProcessor                          │
//! │  (admission, batch scope, fan-out, ordered collection)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Semaphore  /  PriorityQueue                  │
//! │  (one task per item, or a dispatch loop in priority order)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ItemRunner                             │
//! │  (circuit breaker gate, retry loop, item timeout)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use everruns_batch::prelude::*;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let processor = BatchProcessor::new(
//!     BatchConfig::new()
//!         .with_max_concurrency(8)
//!         .with_item_timeout(Duration::from_secs(2))
//!         .with_retry(3, Duration::from_millis(100))
//!         .with_circuit_breaker(5, Duration::from_secs(30)),
//! )?;
//!
//! let urls: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
//! let result = processor
//!     .process(&CancellationToken::new(), urls, |ctx, url: String| async move {
//!         anyhow::Ok(format!("{url} fetched on attempt {}", ctx.attempt))
//!     })
//!     .await?;
//!
//! assert_eq!(result.total_count, 3);
//! for item in &result.results {
//!     println!("{}: {:?}", item.index, item.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod reliability;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::BatchConfig;
    pub use crate::engine::{
        BatchProcessor, BatchResult, ItemContext, ItemResult, ItemStatus, PrioritizedItem,
    };
    pub use crate::error::{BatchError, ItemError};
    pub use crate::reliability::{CircuitBreakerConfig, CircuitState, RetryPolicy};
}

// Re-export key types at crate root
pub use config::BatchConfig;
pub use engine::{BatchProcessor, BatchResult, ItemContext, ItemResult, ItemStatus, PrioritizedItem};
pub use error::{BatchError, ItemError};
pub use observability::{BatchMetrics, Logger, MetricsSink, NoopLogger, NoopMetrics, TracingLogger};
pub use reliability::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState, RetryPolicy,
    RetryableError,
};
