//! Per-tool invocation counters.
//!
//! The store is constructed once at process start and handed by `Arc` to
//! every component that records counters, so the core stays testable in
//! isolation. Counters accumulate for the life of the process and are only
//! cleared by an explicit operator reset.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Counters for a single tool, keyed by `server:tool`.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ToolMetric {
    pub invocations: u64,
    pub successes: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub total_ms: u64,
    pub last_ms: u64,
    /// RFC 3339 timestamp of the most recent call.
    pub last_invoked: Option<String>,
}

/// Process-wide metrics store.
#[derive(Debug, Default)]
pub struct ToolMetrics {
    inner: Mutex<HashMap<String, ToolMetric>>,
}

impl ToolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, key: &str, elapsed: Duration, update: impl FnOnce(&mut ToolMetric)) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let metric = inner.entry(key.to_string()).or_default();
        metric.invocations += 1;
        metric.last_ms = elapsed.as_millis() as u64;
        metric.total_ms += metric.last_ms;
        metric.last_invoked = Some(chrono::Utc::now().to_rfc3339());
        update(metric);
    }

    /// A call that returned a usable result. Retried successes land here too.
    pub fn record_success(&self, key: &str, elapsed: Duration) {
        self.record(key, elapsed, |m| m.successes += 1);
    }

    /// A call that still failed after the retry.
    pub fn record_error(&self, key: &str, elapsed: Duration) {
        self.record(key, elapsed, |m| m.errors += 1);
    }

    /// A call that lost the race against its deadline. Tracked separately
    /// from generic errors.
    pub fn record_timeout(&self, key: &str, elapsed: Duration) {
        self.record(key, elapsed, |m| m.timeouts += 1);
    }

    /// Copy of all counters, for tests and the operator surface.
    pub fn snapshot(&self) -> HashMap<String, ToolMetric> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Explicit operator reset. Nothing else ever clears counters.
    pub fn reset(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_not_errors() {
        let metrics = ToolMetrics::new();
        metrics.record_timeout("srv:slow_tool", Duration::from_millis(500));
        metrics.record_error("srv:slow_tool", Duration::from_millis(10));
        metrics.record_success("srv:slow_tool", Duration::from_millis(20));

        let snapshot = metrics.snapshot();
        let m = &snapshot["srv:slow_tool"];
        assert_eq!(m.invocations, 3);
        assert_eq!(m.timeouts, 1);
        assert_eq!(m.errors, 1);
        assert_eq!(m.successes, 1);
        assert_eq!(m.last_ms, 20);
        assert_eq!(m.total_ms, 530);
    }

    #[test]
    fn reset_clears_everything() {
        let metrics = ToolMetrics::new();
        metrics.record_success("a:b", Duration::from_millis(1));
        assert_eq!(metrics.snapshot().len(), 1);
        metrics.reset();
        assert!(metrics.snapshot().is_empty());
    }
}
