// Logger Trait
//
// Structured informational logging for breaker transitions. The default
// implementation forwards to `tracing`, which is silent until a subscriber
// is installed.

use tracing::info;

/// Receiver for informational log lines
pub trait Logger: Send + Sync {
    /// Log a message with key/value fields
    fn info(&self, message: &str, fields: &[(&str, String)]);
}

/// Forwards to `tracing::info!`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, message: &str, fields: &[(&str, String)]) {
        info!(target: "everruns_batch", ?fields, "{}", message);
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn info(&self, _message: &str, _fields: &[(&str, String)]) {}
}
