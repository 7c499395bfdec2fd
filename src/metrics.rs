//! Prometheus metrics for sync runs
//!
//! Served as text at `GET /metrics` by the HTTP API.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_int_gauge, CounterVec, Encoder, Histogram,
    IntGauge, TextEncoder,
};

lazy_static! {
    /// Counter: items processed by outcome (applied, failed, skipped, deferred)
    pub static ref ITEMS_TOTAL: CounterVec = register_counter_vec!(
        "tasksync_items_total",
        "Change set items processed by outcome",
        &["outcome"]
    )
    .expect("Failed to create items_total metric");

    /// Histogram: apply run duration (seconds)
    pub static ref RUN_DURATION: Histogram = register_histogram!(
        "tasksync_run_duration_seconds",
        "Duration of apply runs",
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .expect("Failed to create run_duration metric");

    /// Counter: adapter errors by backend and error kind
    pub static ref ADAPTER_ERRORS: CounterVec = register_counter_vec!(
        "tasksync_adapter_errors_total",
        "Adapter errors by backend and type",
        &["system", "error_type"]
    )
    .expect("Failed to create adapter_errors metric");

    /// Counter: finished runs by status (completed, cancelled, aborted)
    pub static ref RUNS_TOTAL: CounterVec = register_counter_vec!(
        "tasksync_runs_total",
        "Apply runs by final status",
        &["status"]
    )
    .expect("Failed to create runs_total metric");

    /// Gauge: 1 while an apply run holds the ledger
    pub static ref APPLY_IN_PROGRESS: IntGauge = register_int_gauge!(
        "tasksync_apply_in_progress",
        "Whether an apply run is currently executing"
    )
    .expect("Failed to create apply_in_progress metric");
}

pub fn record_item(outcome: &str) {
    ITEMS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_run(status: &str, duration_secs: f64) {
    RUNS_TOTAL.with_label_values(&[status]).inc();
    RUN_DURATION.observe(duration_secs);
}

pub fn record_adapter_error(system: &str, error_type: &str) {
    ADAPTER_ERRORS.with_label_values(&[system, error_type]).inc();
}

pub fn set_apply_in_progress(active: bool) {
    APPLY_IN_PROGRESS.set(i64::from(active));
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_encode() {
        record_item("applied");
        record_run("completed", 1.5);
        record_adapter_error("doc_store", "transient");
        set_apply_in_progress(false);

        let output = encode_metrics();
        assert!(output.contains("tasksync_items_total"));
        assert!(output.contains("tasksync_run_duration_seconds"));
        assert!(output.contains("tasksync_adapter_errors_total"));
        assert!(output.contains("tasksync_runs_total"));
    }
}
