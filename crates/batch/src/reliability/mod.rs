//! Reliability patterns for batch execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff and jitter
//! - [`RetryableError`] - Allow-list matchers for retryable failures
//! - [`CircuitBreaker`] - Lock-free three-state circuit breaker

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use retry::{RetryPolicy, RetryableError, JITTER_FACTOR};
