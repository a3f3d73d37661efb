// Observability collaborators for the batch engine
//
// The engine only talks to two narrow interfaces:
// - MetricsSink receives one record per batch call and every breaker transition
// - Logger receives breaker transitions
// Both default to implementations that do nothing unless the application
// installs something behind them.

mod logger;
mod metrics;

pub use logger::{Logger, NoopLogger, TracingLogger};
pub use metrics::{BatchMetrics, MetricsSink, NoopMetrics};
