// Metrics Sink Trait
//
// Implemented by whatever metrics backend the application uses. The engine
// calls it synchronously from breaker transitions, so implementations should
// hand work off instead of blocking.

use serde::{Deserialize, Serialize};

use crate::reliability::CircuitState;

/// Aggregate numbers for one top-level batch call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub name: String,
    pub total_items: usize,
    pub success_items: usize,
    pub failed_items: usize,
    pub total_duration_ms: u64,
}

/// Receiver for batch metrics
pub trait MetricsSink: Send + Sync {
    /// Called exactly once per admitted batch call, after aggregation
    fn record_batch_processing(&self, metrics: &BatchMetrics);

    /// Called on every circuit breaker transition
    fn record_circuit_breaker_state_change(
        &self,
        component: &str,
        from: CircuitState,
        to: CircuitState,
    );
}

/// A no-op sink for when metrics are not collected
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_batch_processing(&self, _metrics: &BatchMetrics) {}

    fn record_circuit_breaker_state_change(
        &self,
        _component: &str,
        _from: CircuitState,
        _to: CircuitState,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_sink_accepts_everything() {
        let sink = NoopMetrics;
        sink.record_batch_processing(&BatchMetrics {
            name: "noop".to_string(),
            total_items: 3,
            success_items: 2,
            failed_items: 1,
            total_duration_ms: 12,
        });
        sink.record_circuit_breaker_state_change("noop", CircuitState::Closed, CircuitState::Open);
    }

    #[test]
    fn test_batch_metrics_serialization() {
        let metrics = BatchMetrics {
            name: "scoring".to_string(),
            total_items: 10,
            success_items: 7,
            failed_items: 3,
            total_duration_ms: 420,
        };
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["failed_items"], 3);
        let parsed: BatchMetrics = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, metrics);
    }
}
