//! Lock-free circuit breaker

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::duration_millis;
use crate::observability::{Logger, MetricsSink, NoopMetrics, TracingLogger};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold reached - all calls rejected
    Open,

    /// Reset timeout elapsed - a single probe call allowed
    HalfOpen,
}

impl CircuitState {
    const CLOSED: u8 = 0;
    const OPEN: u8 = 1;
    const HALF_OPEN: u8 = 2;

    fn tag(self) -> u8 {
        match self {
            Self::Closed => Self::CLOSED,
            Self::Open => Self::OPEN,
            Self::HalfOpen => Self::HALF_OPEN,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            Self::OPEN => Self::Open,
            Self::HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// When consecutive failures reach the threshold the circuit "opens" and
/// items fail fast without calling the work function.
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                 └──────────┘
///      ▲                               ▲        probe fails        │
///      │                               └───────────────────────────┤
///      │                    probe succeeds                         │
///      └───────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use everruns_batch::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_reset_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit (0 = disabled)
    pub failure_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the reset timeout (time before probing after opening)
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

/// Three-state circuit breaker built on atomics
///
/// `allow`, `record_success` and `record_failure` are called concurrently
/// from every in-flight item, so every transition is a compare-and-swap on
/// the state tag. The half-open probe is handed out through a single permit
/// that is taken with an atomic decrement-and-check.
///
/// A breaker with a zero failure threshold is disabled: `allow` always
/// returns true and recording is a no-op.
///
/// # Example
///
/// ```
/// use everruns_batch::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::new(
///     CircuitBreakerConfig::new()
///         .with_failure_threshold(2)
///         .with_reset_timeout(Duration::from_secs(30)),
/// );
///
/// breaker.record_failure();
/// breaker.record_failure();
/// assert_eq!(breaker.state(), CircuitState::Open);
/// assert!(!breaker.allow());
/// ```
pub struct CircuitBreaker {
    component: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Nanoseconds since `epoch` when the breaker last opened
    opened_at: AtomicU64,
    half_open_permits: AtomicU32,
    epoch: Instant,
    metrics: Arc<dyn MetricsSink>,
    logger: Arc<dyn Logger>,
}

impl CircuitBreaker {
    /// Create a breaker from configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            component: "circuit_breaker".to_string(),
            failure_threshold: config.failure_threshold,
            reset_timeout: config.reset_timeout,
            state: AtomicU8::new(CircuitState::CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
            half_open_permits: AtomicU32::new(0),
            epoch: Instant::now(),
            metrics: Arc::new(NoopMetrics),
            logger: Arc::new(TracingLogger),
        }
    }

    /// Create a breaker that always allows calls
    pub fn disabled() -> Self {
        Self::new(CircuitBreakerConfig::new().with_failure_threshold(0))
    }

    /// Set the component name reported on transitions
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    /// Set the metrics sink notified on transitions
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set the logger notified on transitions
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Whether the breaker gates calls at all
    pub fn is_enabled(&self) -> bool {
        self.failure_threshold > 0
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        CircuitState::from_tag(self.state.load(Ordering::Acquire))
    }

    /// Check if a call should be allowed
    ///
    /// Open circuits move to half-open lazily here once the reset timeout has
    /// elapsed. Only one caller receives the probe permit.
    pub fn allow(&self) -> bool {
        if !self.is_enabled() {
            return true;
        }

        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.open_elapsed() < self.reset_timeout {
                    return false;
                }
                self.transition(CircuitState::Open, CircuitState::HalfOpen);
                self.take_probe_permit()
            }
            CircuitState::HalfOpen => self.take_probe_permit(),
        }
    }

    /// Record a successful call
    ///
    /// Resets the failure streak and closes a half-open circuit.
    pub fn record_success(&self) {
        if !self.is_enabled() {
            return;
        }

        self.consecutive_failures.store(0, Ordering::Release);
        if self.state() == CircuitState::HalfOpen
            && self.transition(CircuitState::HalfOpen, CircuitState::Closed)
        {
            self.half_open_permits.store(0, Ordering::Release);
        }
    }

    /// Record a failed call
    ///
    /// Opens a closed circuit once the streak reaches the threshold and
    /// reopens a half-open circuit immediately.
    pub fn record_failure(&self) {
        if !self.is_enabled() {
            return;
        }

        let failures = self
            .consecutive_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_add(1))
            })
            .map_or(u32::MAX, |prev| prev.saturating_add(1));

        match self.state() {
            CircuitState::HalfOpen => {
                self.trip(CircuitState::HalfOpen);
            }
            CircuitState::Closed if failures >= self.failure_threshold => {
                self.trip(CircuitState::Closed);
            }
            _ => {}
        }
    }

    /// Force the circuit closed and clear all counters
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.half_open_permits.store(0, Ordering::Release);
        let previous =
            CircuitState::from_tag(self.state.swap(CircuitState::CLOSED, Ordering::AcqRel));
        if previous != CircuitState::Closed {
            self.notify(previous, CircuitState::Closed);
        }
    }

    /// Take a snapshot of the current state
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state();
        let open_remaining_ms = match state {
            CircuitState::Open => self
                .reset_timeout
                .checked_sub(self.open_elapsed())
                .map(|d| d.as_millis() as u64),
            _ => None,
        };

        CircuitBreakerSnapshot {
            state,
            failure_threshold: self.failure_threshold,
            reset_timeout_ms: self.reset_timeout.as_millis() as u64,
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            open_remaining_ms,
        }
    }

    fn trip(&self, from: CircuitState) {
        // opened_at must be visible before the state flips to Open.
        self.opened_at.store(self.now_nanos(), Ordering::Release);
        if self.transition(from, CircuitState::Open) {
            self.half_open_permits.store(1, Ordering::Release);
        }
    }

    fn take_probe_permit(&self) -> bool {
        self.half_open_permits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1))
            .is_ok()
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from.tag(), to.tag(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.notify(from, to);
        }
        swapped
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        self.metrics
            .record_circuit_breaker_state_change(&self.component, from, to);
        self.logger.info(
            "circuit breaker state changed",
            &[
                ("component", self.component.clone()),
                ("from", from.to_string()),
                ("to", to.to_string()),
            ],
        );
    }

    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn open_elapsed(&self) -> Duration {
        let opened_at = self.opened_at.load(Ordering::Acquire);
        Duration::from_nanos(self.now_nanos().saturating_sub(opened_at))
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("component", &self.component)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
