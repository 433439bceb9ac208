//! Metrics sink: event counters and last-seen gauges
//!
//! Collectors live in a caller-supplied registry so several bridges (or
//! tests) can coexist in one process. Counters only ever increment, so a
//! duplicate delivery adds one but never corrupts the series.

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use prometheus::{CounterVec, GaugeVec, Opts, Registry};
use vahti_core::{CanonicalEvent, Category, Sink, SinkError};

pub struct MetricsSink {
    events_total: CounterVec,
    last_event_timestamp: GaugeVec,
}

impl MetricsSink {
    /// Create the collectors and register them into `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let events_total = CounterVec::new(
            Opts::new("unifi_events_total", "Canonical events by category and type"),
            &["category", "type"],
        )
        .map_err(|e| BridgeError::Metrics(format!("unifi_events_total: {e}")))?;
        let last_event_timestamp = GaugeVec::new(
            Opts::new(
                "unifi_last_event_timestamp_seconds",
                "Timestamp of the newest event seen per category",
            ),
            &["category"],
        )
        .map_err(|e| BridgeError::Metrics(format!("unifi_last_event_timestamp_seconds: {e}")))?;

        registry
            .register(Box::new(events_total.clone()))
            .map_err(|e| BridgeError::Metrics(format!("unifi_events_total: {e}")))?;
        registry
            .register(Box::new(last_event_timestamp.clone()))
            .map_err(|e| BridgeError::Metrics(format!("unifi_last_event_timestamp_seconds: {e}")))?;

        Ok(Self {
            events_total,
            last_event_timestamp,
        })
    }

    pub fn event_count(&self, category: Category, event_type: &str) -> f64 {
        self.events_total
            .with_label_values(&[category.as_str(), event_type])
            .get()
    }

    pub fn last_event_timestamp(&self, category: Category) -> f64 {
        self.last_event_timestamp
            .with_label_values(&[category.as_str()])
            .get()
    }
}

#[async_trait]
impl Sink for MetricsSink {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn emit(&self, event: &CanonicalEvent) -> std::result::Result<(), SinkError> {
        let category = event.category.as_str();
        self.events_total
            .with_label_values(&[category, event.event_type.as_str()])
            .inc();

        let gauge = self.last_event_timestamp.with_label_values(&[category]);
        let ts = event.timestamp_millis() as f64 / 1000.0;
        if ts > gauge.get() {
            gauge.set(ts);
        }
        Ok(())
    }

    async fn health(&self) -> bool {
        true
    }
}
