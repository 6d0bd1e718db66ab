//! Metrics sink abstraction
//!
//! A write-only surface for counters, gauges and histograms, tagged by name
//! and labels. The coordinator emits through [`MetricsSink`] and never reads
//! back; backends are pluggable (in-memory for tests and dashboards, null
//! for embedders that bring their own pipeline).

use std::sync::Arc;

use dashmap::DashMap;

/// Metric names emitted by the coordinator.
pub mod names {
    pub const TASKS_SPAWNED: &str = "visflow_tasks_spawned";
    pub const TASKS_CLAIMED: &str = "visflow_tasks_claimed";
    pub const TASKS_COMPLETED: &str = "visflow_tasks_completed";
    pub const TASKS_FAILED: &str = "visflow_tasks_failed";
    pub const TASKS_DEAD: &str = "visflow_tasks_dead";
    pub const TASKS_CANCELLED: &str = "visflow_tasks_cancelled";
    pub const TASKS_DUPLICATED: &str = "visflow_tasks_duplicated";
    pub const TASKS_RECOVERED: &str = "visflow_tasks_recovered";

    pub const QUEUE_DEPTH: &str = "visflow_queue_depth";
    pub const OLDEST_PENDING_AGE: &str = "visflow_oldest_pending_age_seconds";
    pub const ACTIVE_WORKERS: &str = "visflow_active_workers";
    pub const BREAKER_STATE: &str = "visflow_breaker_state";

    pub const INGEST_GROUPS: &str = "visflow_ingest_groups";
    pub const INGEST_FILES_REJECTED: &str = "visflow_ingest_files_rejected";
    pub const INGEST_DUPLICATE_SUBBANDS: &str = "visflow_ingest_duplicate_subbands";
    pub const INGEST_BACKPRESSURE: &str = "visflow_ingest_backpressure";

    pub const TASK_WAIT_SECONDS: &str = "visflow_task_wait_seconds";
    pub const TASK_EXEC_SECONDS: &str = "visflow_task_exec_seconds";
    pub const TASK_TOTAL_SECONDS: &str = "visflow_task_total_seconds";
}

/// Write-only metrics interface.
///
/// Labels are `(key, value)` pairs; the coordinator labels task metrics with
/// `queue` and `task` throughout.
pub trait MetricsSink: Send + Sync + 'static {
    /// Increment a monotonic counter.
    fn counter(&self, name: &str, labels: &[(&str, &str)], delta: u64);

    /// Record the current value of a gauge.
    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);

    /// Record an observation into a histogram.
    fn histogram(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut key = String::with_capacity(name.len() + 16 * labels.len());
    key.push_str(name);
    for (k, v) in labels {
        key.push('{');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
        key.push('}');
    }
    key
}

/// In-memory sink with read-back accessors.
///
/// Primarily for tests, also suitable as the backing store for a dashboard
/// scrape endpoint assembled outside this crate.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    histograms: DashMap<String, Vec<f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter series, 0 if never written.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&series_key(name, labels))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Last written value of a gauge series.
    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.get(&series_key(name, labels)).map(|v| *v)
    }

    /// All observations recorded into a histogram series.
    pub fn histogram_values(&self, name: &str, labels: &[(&str, &str)]) -> Vec<f64> {
        self.histograms
            .get(&series_key(name, labels))
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn counter(&self, name: &str, labels: &[(&str, &str)], delta: u64) {
        *self.counters.entry(series_key(name, labels)).or_insert(0) += delta;
    }

    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges.insert(series_key(name, labels), value);
    }

    fn histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms
            .entry(series_key(name, labels))
            .or_default()
            .push(value);
    }
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn counter(&self, _name: &str, _labels: &[(&str, &str)], _delta: u64) {}
    fn gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
    fn histogram(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
}

/// Shared handle type used across the crate.
pub type SharedMetrics = Arc<dyn MetricsSink>;
