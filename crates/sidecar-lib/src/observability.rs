//! Observability infrastructure
//!
//! Provides:
//! - Prometheus metrics for the execution pipeline
//! - Structured lifecycle logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    GaugeVec, HistogramVec, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::info;

/// Histogram buckets for pipeline sub-phase durations (in seconds).
const PHASE_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<SidecarMetricsInner> = OnceLock::new();

struct SidecarMetricsInner {
    requests_in_flight: IntGauge,
    requests_total: IntCounterVec,
    phase_duration_seconds: HistogramVec,
    runtime_info: GaugeVec,
}

impl SidecarMetricsInner {
    fn new() -> Self {
        Self {
            requests_in_flight: register_int_gauge!(
                "wasm_sidecar_requests_in_flight",
                "Requests currently executing"
            )
            .expect("Failed to register requests_in_flight"),

            requests_total: register_int_counter_vec!(
                "wasm_sidecar_requests_total",
                "Completed requests by outcome",
                &["outcome"]
            )
            .expect("Failed to register requests_total"),

            phase_duration_seconds: register_histogram_vec!(
                "wasm_sidecar_phase_duration_seconds",
                "Pipeline sub-phase durations",
                &["phase"],
                PHASE_BUCKETS.to_vec()
            )
            .expect("Failed to register phase_duration_seconds"),

            runtime_info: register_gauge_vec!(
                "wasm_sidecar_runtime_info",
                "Configured WASM runtime",
                &["runtime"]
            )
            .expect("Failed to register runtime_info"),
        }
    }
}

/// Sidecar metrics for Prometheus exposition.
///
/// A lightweight handle to the global instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct SidecarMetrics {
    _private: (),
}

impl Default for SidecarMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SidecarMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SidecarMetricsInner::new);
        Self { _private: () }
    }

    fn inner() -> &'static SidecarMetricsInner {
        GLOBAL_METRICS.get_or_init(SidecarMetricsInner::new)
    }

    pub fn set_runtime(&self, runtime: &str) {
        Self::inner()
            .runtime_info
            .with_label_values(&[runtime])
            .set(1.0);
    }

    pub fn request_started(&self) {
        Self::inner().requests_in_flight.inc();
    }

    pub fn request_finished(&self, outcome: &str) {
        let inner = Self::inner();
        inner.requests_in_flight.dec();
        inner.requests_total.with_label_values(&[outcome]).inc();
    }

    pub fn observe_phase(&self, phase: &str, seconds: f64) {
        Self::inner()
            .phase_duration_seconds
            .with_label_values(&[phase])
            .observe(seconds);
    }
}

/// Structured lifecycle logging tagged with the pod identity.
pub struct StructuredLogger {
    pod_uid: String,
}

impl StructuredLogger {
    pub fn new(pod_uid: &str) -> Self {
        Self {
            pod_uid: pod_uid.to_string(),
        }
    }

    pub fn log_startup(&self, version: &str, runtime: &str) {
        info!(
            pod_uid = %self.pod_uid,
            version,
            runtime,
            event = "startup",
            "WASM execution sidecar starting"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            pod_uid = %self.pod_uid,
            reason,
            event = "shutdown",
            "WASM execution sidecar stopping"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once_and_record() {
        let metrics = SidecarMetrics::new();
        let clone = metrics.clone();

        metrics.set_runtime("wasmtime");
        metrics.request_started();
        clone.observe_phase("execution", 0.002);
        clone.request_finished("success");

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "wasm_sidecar_requests_total"));
    }
}
