//! Batch orchestrator
//!
//! Admits a call, fans its items out over tokio tasks bounded by a shared
//! semaphore, and collects the outcomes back into submission order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};
use uuid::Uuid;

use super::admission::{AdmissionControl, AdmissionGuard};
use super::item::{ItemContext, ItemResult, ItemRunner};
use super::priority::{PrioritizedItem, PriorityQueue};
use super::result::BatchResult;
use super::scope::{Interrupt, Scope};
use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::observability::{Logger, MetricsSink, NoopMetrics, TracingLogger};
use crate::reliability::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};

/// Resilient batch executor
///
/// One processor is meant to be shared (usually behind an `Arc`) by every
/// caller that talks to the same downstream. The semaphore, the circuit
/// breaker and the pending-item counter are shared by all of its calls.
///
/// # Example
///
/// ```
/// use everruns_batch::{BatchConfig, BatchProcessor};
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let processor = BatchProcessor::new(
///     BatchConfig::new()
///         .with_name("thumbnails")
///         .with_max_concurrency(4)
///         .with_retry(2, Duration::from_millis(50)),
/// )?;
///
/// let cancel = CancellationToken::new();
/// let result = processor
///     .process(&cancel, vec![1, 2, 3], |_ctx, n: u64| async move {
///         anyhow::Ok(n * 10)
///     })
///     .await?;
///
/// assert_eq!(result.success_count, 3);
/// assert_eq!(result.results[2].result, Some(30));
///
/// processor.shutdown(Duration::from_secs(5)).await?;
/// # Ok(())
/// # }
/// ```
pub struct BatchProcessor {
    config: BatchConfig,
    semaphore: Arc<Semaphore>,
    breaker: Arc<CircuitBreaker>,
    admission: Arc<AdmissionControl>,
    metrics: Arc<dyn MetricsSink>,
    logger: Arc<dyn Logger>,
}

impl BatchProcessor {
    /// Create a processor from a validated configuration
    pub fn new(config: BatchConfig) -> Result<Self, BatchError> {
        config.validate()?;

        let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);
        let logger: Arc<dyn Logger> = Arc::new(TracingLogger);
        let breaker = Arc::new(build_breaker(&config, &metrics, &logger));

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            admission: Arc::new(AdmissionControl::new(config.backpressure_threshold)),
            breaker,
            metrics,
            logger,
            config,
        })
    }

    /// Set the metrics sink
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self.breaker = Arc::new(build_breaker(&self.config, &self.metrics, &self.logger));
        self
    }

    /// Set the logger used for breaker transitions
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self.breaker = Arc::new(build_breaker(&self.config, &self.metrics, &self.logger));
        self
    }

    /// Process `items` concurrently and return one result per item
    ///
    /// Every item gets its own task; at most `max_concurrency` run the work
    /// function at once across all calls on this processor. Items still
    /// waiting for a slot when the batch timeout elapses (or `cancel` fires)
    /// end as Timeout (or Cancelled) without running.
    ///
    /// Returns `Err` only when the call is not admitted.
    #[instrument(
        skip_all,
        fields(batch = %self.config.name, batch_id = tracing::field::Empty, items = items.len())
    )]
    pub async fn process<T, R, F, Fut>(
        &self,
        cancel: &CancellationToken,
        items: Vec<T>,
        work: F,
    ) -> Result<BatchResult<R>, BatchError>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(ItemContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let _admission = self.admit(items.len())?;
        let run = RunInfo::begin();
        if items.is_empty() {
            return Ok(self.finish(run, Vec::new()));
        }

        let total = items.len();
        let scope = Scope::root(cancel, self.config.batch_timeout);
        let _teardown = scope.token().clone().drop_guard();
        let runner = Arc::new(self.runner(work));
        let (tx, rx) = mpsc::channel(total);

        for (index, item) in items.into_iter().enumerate() {
            let runner = Arc::clone(&runner);
            let semaphore = Arc::clone(&self.semaphore);
            let scope = scope.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let result = tokio::select! {
                    biased;
                    interrupt = scope.done() => ItemResult::interrupted(index, interrupt),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(_permit) => runner.run(index, item, &scope).await,
                        Err(_) => ItemResult::interrupted(index, Interrupt::Cancelled),
                    },
                };
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let results = collect(rx, total).await;
        Ok(self.finish(run, results))
    }

    /// Process `items` starting the highest priority first
    ///
    /// Slots are acquired in the dispatch loop before each task is spawned,
    /// so a freed slot always goes to the highest-priority item still
    /// waiting. Equal priorities start in submission order. Results are in
    /// submission order, not dispatch order.
    #[instrument(
        skip_all,
        fields(batch = %self.config.name, batch_id = tracing::field::Empty, items = items.len())
    )]
    pub async fn process_with_priority<T, R, F, Fut>(
        &self,
        cancel: &CancellationToken,
        items: Vec<PrioritizedItem<T>>,
        work: F,
    ) -> Result<BatchResult<R>, BatchError>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(ItemContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let _admission = self.admit(items.len())?;
        let run = RunInfo::begin();
        if items.is_empty() {
            return Ok(self.finish(run, Vec::new()));
        }

        let total = items.len();
        let scope = Scope::root(cancel, self.config.batch_timeout);
        let _teardown = scope.token().clone().drop_guard();
        let runner = Arc::new(self.runner(work));
        let (tx, rx) = mpsc::channel(total);
        let mut queue = PriorityQueue::from_items(items);

        while let Some((index, item)) = queue.pop() {
            let acquired = tokio::select! {
                biased;
                interrupt = scope.done() => Err(interrupt),
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    permit.map_err(|_| Interrupt::Cancelled)
                }
            };

            let permit = match acquired {
                Ok(permit) => permit,
                Err(interrupt) => {
                    debug!(
                        remaining = queue.len() + 1,
                        "Batch scope ended during dispatch"
                    );
                    // Capacity covers every index, so these sends never wait
                    let _ = tx.send(ItemResult::interrupted(index, interrupt)).await;
                    for index in queue.into_indices() {
                        let _ = tx.send(ItemResult::interrupted(index, interrupt)).await;
                    }
                    break;
                }
            };

            let runner = Arc::clone(&runner);
            let scope = scope.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let result = runner.run(index, item, &scope).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let results = collect(rx, total).await;
        Ok(self.finish(run, results))
    }

    /// Stop admitting calls and wait for in-flight calls to finish
    ///
    /// Calls made after the first `shutdown` fail with
    /// [`BatchError::Shutdown`]. When `timeout` elapses first, in-flight work
    /// keeps running and [`BatchError::ShutdownTimeout`] is returned.
    #[instrument(skip(self), fields(batch = %self.config.name))]
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), BatchError> {
        if self.admission.stop_accepting() {
            info!(
                active_calls = self.admission.active_calls(),
                "Initiating graceful shutdown"
            );
        }

        match tokio::time::timeout(timeout, self.admission.drained()).await {
            Ok(()) => {
                info!("Batch processor drained");
                Ok(())
            }
            Err(_) => {
                let remaining = self.admission.active_calls();
                warn!(remaining_calls = remaining, "Shutdown timeout reached");
                Err(BatchError::ShutdownTimeout(timeout, remaining))
            }
        }
    }

    /// Items admitted but not yet completed, across all calls
    pub fn pending(&self) -> usize {
        self.admission.pending()
    }

    /// Top-level calls currently in flight
    pub fn active_calls(&self) -> usize {
        self.admission.active_calls()
    }

    /// False once shutdown has begun
    pub fn is_accepting(&self) -> bool {
        self.admission.is_accepting()
    }

    /// Free concurrency slots
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn circuit_snapshot(&self) -> CircuitBreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Force the circuit breaker closed
    pub fn reset_circuit(&self) {
        self.breaker.reset();
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    fn admit(&self, items: usize) -> Result<AdmissionGuard, BatchError> {
        self.admission.admit(items).inspect_err(|err| {
            debug!(
                pending = self.admission.pending(),
                requested = items,
                error = %err,
                "Batch rejected"
            );
        })
    }

    fn runner<F>(&self, work: F) -> ItemRunner<F> {
        ItemRunner::new(
            work,
            Arc::clone(&self.breaker),
            self.config.retry.clone(),
            self.config.item_timeout,
        )
    }

    fn finish<R>(&self, run: RunInfo, results: Vec<ItemResult<R>>) -> BatchResult<R> {
        let batch = BatchResult::from_results(
            run.batch_id,
            run.started_at,
            results,
            run.started.elapsed(),
        );
        self.metrics
            .record_batch_processing(&batch.metrics(&self.config.name));

        debug!(
            total = batch.total_count,
            success = batch.success_count,
            failed = batch.failure_count,
            duration_ms = batch.total_duration_ms(),
            "Batch completed"
        );
        batch
    }
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.config)
            .field("available_permits", &self.available_permits())
            .field("pending", &self.pending())
            .field("active_calls", &self.active_calls())
            .field("breaker", &self.breaker)
            .finish()
    }
}

/// Identity and start time of one admitted call
struct RunInfo {
    batch_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl RunInfo {
    fn begin() -> Self {
        let batch_id = Uuid::now_v7();
        Span::current().record("batch_id", tracing::field::display(batch_id));
        Self {
            batch_id,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }
}

fn build_breaker(
    config: &BatchConfig,
    metrics: &Arc<dyn MetricsSink>,
    logger: &Arc<dyn Logger>,
) -> CircuitBreaker {
    let breaker = match &config.circuit_breaker {
        Some(breaker) => CircuitBreaker::new(breaker.clone()),
        None => CircuitBreaker::disabled(),
    };
    breaker
        .with_component(config.name.clone())
        .with_metrics(Arc::clone(metrics))
        .with_logger(Arc::clone(logger))
}

/// Gather results into submission order
///
/// A slot whose task never reported (it panicked or was aborted) is filled
/// with a Cancelled result.
async fn collect<R>(mut rx: mpsc::Receiver<ItemResult<R>>, total: usize) -> Vec<ItemResult<R>> {
    let mut slots: Vec<Option<ItemResult<R>>> = (0..total).map(|_| None).collect();
    while let Some(result) = rx.recv().await {
        if let Some(slot) = slots.get_mut(result.index) {
            *slot = Some(result);
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| ItemResult::interrupted(index, Interrupt::Cancelled))
        })
        .collect()
}
