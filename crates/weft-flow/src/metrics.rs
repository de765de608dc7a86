//! Pluggable metrics.
//!
//! The engine records a small, fixed set of counters and one histogram
//! through the [`MetricsProvider`] trait. The default provider keeps
//! readable in-memory values (handy for tests and embedding); the
//! [`FacadeMetrics`] provider forwards to the `metrics` crate facade so a
//! Prometheus (or any other) exporter installed by the host picks them up.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: tasks that reached a successful terminal state.
    pub const TASKS_SUCCEEDED: &str = "tasks_succeeded";
    /// Counter: tasks that reached a failed terminal state.
    pub const TASKS_FAILED: &str = "tasks_failed";
    /// Counter: dispatches satisfied from the result cache.
    pub const CACHE_HITS: &str = "cache_hits";
    /// Counter: successful results written to the cache.
    pub const CACHE_SETS: &str = "cache_sets";
    /// Counter: dispatches that joined an identical in-flight execution.
    pub const DEDUP_JOINS: &str = "dedup_joins";
    /// Histogram: end-to-end task execution duration in milliseconds.
    pub const TASK_DURATION_MS: &str = "task_duration_ms";
}

/// Sink for engine metrics. Swappable at runtime; cheap to call.
pub trait MetricsProvider: Send + Sync {
    /// Increments a counter.
    fn inc(&self, name: &str, value: u64);

    /// Records a histogram observation.
    fn observe(&self, name: &str, value: f64);
}

/// In-memory provider with readable snapshots. The default.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<String, u64>>,
    histograms: Mutex<BTreeMap<String, Vec<f64>>>,
}

impl InMemoryMetrics {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 when never incremented).
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .expect("metrics lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// All recorded observations for a histogram.
    #[must_use]
    pub fn histogram(&self, name: &str) -> Vec<f64> {
        self.histograms
            .lock()
            .expect("metrics lock poisoned")
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every counter.
    #[must_use]
    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.counters.lock().expect("metrics lock poisoned").clone()
    }
}

impl MetricsProvider for InMemoryMetrics {
    fn inc(&self, name: &str, value: u64) {
        let mut counters = self.counters.lock().expect("metrics lock poisoned");
        *counters.entry(name.to_string()).or_insert(0) += value;
    }

    fn observe(&self, name: &str, value: f64) {
        let mut histograms = self.histograms.lock().expect("metrics lock poisoned");
        histograms.entry(name.to_string()).or_default().push(value);
    }
}

/// Provider that forwards to the `metrics` crate facade, prefixing names
/// with `weft_` so they are recognizable next to host metrics.
#[derive(Debug, Clone, Default)]
pub struct FacadeMetrics;

impl FacadeMetrics {
    /// Creates the facade provider.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl MetricsProvider for FacadeMetrics {
    fn inc(&self, name: &str, value: u64) {
        metrics::counter!(format!("weft_{name}")).increment(value);
    }

    fn observe(&self, name: &str, value: f64) {
        metrics::histogram!(format!("weft_{name}")).record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = InMemoryMetrics::new();
        m.inc(names::TASKS_SUCCEEDED, 1);
        m.inc(names::TASKS_SUCCEEDED, 2);
        assert_eq!(m.counter(names::TASKS_SUCCEEDED), 3);
        assert_eq!(m.counter(names::TASKS_FAILED), 0);
    }

    #[test]
    fn histograms_record_observations() {
        let m = InMemoryMetrics::new();
        m.observe(names::TASK_DURATION_MS, 1.5);
        m.observe(names::TASK_DURATION_MS, 2.5);
        assert_eq!(m.histogram(names::TASK_DURATION_MS), vec![1.5, 2.5]);
    }

    #[test]
    fn facade_provider_does_not_panic_without_a_recorder() {
        let m = FacadeMetrics::new();
        m.inc(names::CACHE_HITS, 1);
        m.observe(names::TASK_DURATION_MS, 12.0);
    }
}
