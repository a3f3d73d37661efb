//! Aggregated outcome of one batch call

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::item::ItemResult;
use crate::error::ItemError;
use crate::observability::BatchMetrics;

/// Outcome of a batch call
///
/// `results` always holds one entry per submitted item, ordered by index.
#[derive(Debug)]
pub struct BatchResult<R> {
    /// Unique ID of this call (UUID v7)
    pub batch_id: Uuid,

    /// When the call was admitted
    pub started_at: DateTime<Utc>,

    /// Per-item outcomes in submission order
    pub results: Vec<ItemResult<R>>,

    pub total_count: usize,
    pub success_count: usize,

    /// Items that ended in any non-success status
    pub failure_count: usize,

    /// Wall time of the whole call
    pub total_duration: Duration,

    /// Mean of the per-item durations (zero for an empty batch)
    pub avg_item_duration: Duration,
}

impl<R> BatchResult<R> {
    pub(crate) fn from_results(
        batch_id: Uuid,
        started_at: DateTime<Utc>,
        results: Vec<ItemResult<R>>,
        total_duration: Duration,
    ) -> Self {
        let total_count = results.len();
        let success_count = results.iter().filter(|r| r.is_success()).count();
        let item_time: Duration = results.iter().map(|r| r.duration).sum();
        let avg_item_duration = match u32::try_from(total_count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => item_time / n,
            Err(_) => Duration::from_secs_f64(item_time.as_secs_f64() / total_count as f64),
        };

        Self {
            batch_id,
            started_at,
            results,
            total_count,
            success_count,
            failure_count: total_count - success_count,
            total_duration,
            avg_item_duration,
        }
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.total_duration.as_millis() as u64
    }

    pub fn avg_item_duration_ms(&self) -> u64 {
        self.avg_item_duration.as_millis() as u64
    }

    /// Fraction of items that succeeded (1.0 for an empty batch)
    pub fn success_rate(&self) -> f64 {
        if self.total_count == 0 {
            1.0
        } else {
            self.success_count as f64 / self.total_count as f64
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0
    }

    /// Iterate over failed items as `(index, error)`
    pub fn failures(&self) -> impl Iterator<Item = (usize, &ItemError)> {
        self.results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| (r.index, e)))
    }

    /// Per-item outcomes as plain results, in submission order
    pub fn into_values(self) -> Vec<Result<R, ItemError>> {
        self.results.into_iter().map(ItemResult::into_result).collect()
    }

    /// Metrics record for this call
    pub fn metrics(&self, name: &str) -> BatchMetrics {
        BatchMetrics {
            name: name.to_string(),
            total_items: self.total_count,
            success_items: self.success_count,
            failed_items: self.failure_count,
            total_duration_ms: self.total_duration_ms(),
        }
    }
}
