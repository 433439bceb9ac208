//! Prometheus metrics for the vahti pipeline itself
//!
//! These describe how the bridge is doing (polls, upstream calls, sink
//! deliveries). The event-derived series (`unifi_events_total` and friends)
//! belong to [`MetricsSink`](crate::sink::MetricsSink).

use crate::error::{BridgeError, Result};
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramVec, TextEncoder, register_counter_vec,
    register_gauge_vec, register_histogram_vec,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All pipeline metrics
pub struct Metrics {
    // ─────────────────────────────────────────────────────────────────────────
    // Poll cycles
    // ─────────────────────────────────────────────────────────────────────────
    /// Poll cycles by category and outcome (success/failure)
    pub polls_total: CounterVec,

    /// Wall time of one poll cycle
    pub poll_duration_seconds: HistogramVec,

    /// Current failure streak per category
    pub consecutive_failures: GaugeVec,

    // ─────────────────────────────────────────────────────────────────────────
    // Upstream
    // ─────────────────────────────────────────────────────────────────────────
    /// Upstream calls by category and outcome (ok or error kind)
    pub upstream_requests_total: CounterVec,

    /// Retries of idempotent calls after transient failures
    pub upstream_retries_total: CounterVec,

    /// Primary credential rejected, secondary tried
    pub auth_fallbacks_total: CounterVec,

    // ─────────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────────
    /// Raw records the normalizer skipped
    pub events_malformed_total: CounterVec,

    /// Events dropped by the dedup buffer (duplicate or stale)
    pub events_duplicate_total: CounterVec,

    /// Deliveries by sink and outcome (ok/error/timeout)
    pub sink_deliveries_total: CounterVec,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            polls_total: register_counter_vec!(
                "vahti_polls_total",
                "Poll cycles by outcome",
                &["category", "outcome"]
            )
            .map_err(|e| BridgeError::Metrics(format!("polls_total: {e}")))?,

            poll_duration_seconds: register_histogram_vec!(
                "vahti_poll_duration_seconds",
                "Time spent in one poll cycle",
                &["category"],
                // Buckets: 10ms to 2min (retries with backoff can run long)
                vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0]
            )
            .map_err(|e| BridgeError::Metrics(format!("poll_duration_seconds: {e}")))?,

            consecutive_failures: register_gauge_vec!(
                "vahti_consecutive_failures",
                "Consecutive failed poll cycles",
                &["category"]
            )
            .map_err(|e| BridgeError::Metrics(format!("consecutive_failures: {e}")))?,

            upstream_requests_total: register_counter_vec!(
                "vahti_upstream_requests_total",
                "Upstream API calls by outcome",
                &["category", "outcome"]
            )
            .map_err(|e| BridgeError::Metrics(format!("upstream_requests_total: {e}")))?,

            upstream_retries_total: register_counter_vec!(
                "vahti_upstream_retries_total",
                "Upstream retries after transient failures",
                &["category"]
            )
            .map_err(|e| BridgeError::Metrics(format!("upstream_retries_total: {e}")))?,

            auth_fallbacks_total: register_counter_vec!(
                "vahti_auth_fallbacks_total",
                "Calls that fell back from the API key to the session credential",
                &["category"]
            )
            .map_err(|e| BridgeError::Metrics(format!("auth_fallbacks_total: {e}")))?,

            events_malformed_total: register_counter_vec!(
                "vahti_events_malformed_total",
                "Raw records skipped as malformed",
                &["category"]
            )
            .map_err(|e| BridgeError::Metrics(format!("events_malformed_total: {e}")))?,

            events_duplicate_total: register_counter_vec!(
                "vahti_events_duplicate_total",
                "Events dropped as already delivered",
                &["category"]
            )
            .map_err(|e| BridgeError::Metrics(format!("events_duplicate_total: {e}")))?,

            sink_deliveries_total: register_counter_vec!(
                "vahti_sink_deliveries_total",
                "Sink deliveries by outcome",
                &["sink", "outcome"]
            )
            .map_err(|e| BridgeError::Metrics(format!("sink_deliveries_total: {e}")))?,
        };

        // Set the metrics (only succeeds once)
        let _ = METRICS.set(metrics);
        METRICS
            .get()
            .ok_or_else(|| BridgeError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    pub fn record_poll(&self, category: &str, success: bool, seconds: f64) {
        let outcome = if success { "success" } else { "failure" };
        self.polls_total
            .with_label_values(&[category, outcome])
            .inc();
        self.poll_duration_seconds
            .with_label_values(&[category])
            .observe(seconds);
    }

    pub fn set_consecutive_failures(&self, category: &str, failures: u32) {
        self.consecutive_failures
            .with_label_values(&[category])
            .set(failures as f64);
    }

    /// `outcome` is "ok" or an `ApiErrorKind` label
    pub fn record_upstream(&self, category: &str, outcome: &str) {
        self.upstream_requests_total
            .with_label_values(&[category, outcome])
            .inc();
    }

    pub fn record_retry(&self, category: &str) {
        self.upstream_retries_total
            .with_label_values(&[category])
            .inc();
    }

    pub fn record_auth_fallback(&self, category: &str) {
        self.auth_fallbacks_total
            .with_label_values(&[category])
            .inc();
    }

    pub fn record_malformed(&self, category: &str, count: u64) {
        self.events_malformed_total
            .with_label_values(&[category])
            .inc_by(count as f64);
    }

    pub fn record_duplicates(&self, category: &str, count: u64) {
        self.events_duplicate_total
            .with_label_values(&[category])
            .inc_by(count as f64);
    }

    pub fn record_sink_delivery(&self, sink: &str, outcome: &str) {
        self.sink_deliveries_total
            .with_label_values(&[sink, outcome])
            .inc();
    }
}

/// Gather all metrics from the default registry as Prometheus text format
pub fn gather() -> String {
    encode(&prometheus::gather())
}

/// Encode metric families in the text exposition format
pub fn encode(families: &[prometheus::proto::MetricFamily]) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init_is_idempotent() {
        let first = Metrics::init().unwrap() as *const Metrics;
        let second = Metrics::init().unwrap() as *const Metrics;
        assert_eq!(first, second);
        assert!(Metrics::get().is_some());
    }

    #[test]
    fn test_recorded_series_show_up_in_gather() {
        let metrics = Metrics::init().unwrap();
        metrics.record_poll("access", true, 0.2);
        metrics.record_upstream("access", "ok");
        metrics.record_sink_delivery("annotations", "error");
        metrics.set_consecutive_failures("protect", 3);

        let text = gather();
        assert!(text.contains("vahti_polls_total"));
        assert!(text.contains("vahti_upstream_requests_total"));
        assert!(text.contains("vahti_sink_deliveries_total"));
        assert!(text.contains("vahti_consecutive_failures{category=\"protect\"} 3"));
    }
}
