//! Sink fan-out
//!
//! Every canonical event goes to every registered sink. Sinks are best-effort:
//! a failed or timed-out delivery is logged, counted in the category's health
//! record, and not retried. One sink failing never stops delivery to the
//! others.

pub mod annotations;
pub mod metrics;

pub use annotations::AnnotationSink;
pub use metrics::MetricsSink;

use crate::health::{HealthAggregator, Outcome};
use crate::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vahti_core::{CanonicalEvent, Sink, SinkError};

/// Result of delivering one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Delivers events to all sinks, each call bounded by a timeout
pub struct SinkFanout {
    sinks: Vec<Arc<dyn Sink>>,
    timeout: Duration,
    health: Arc<HealthAggregator>,
}

impl SinkFanout {
    pub fn new(sinks: Vec<Arc<dyn Sink>>, timeout: Duration, health: Arc<HealthAggregator>) -> Self {
        Self {
            sinks,
            timeout,
            health,
        }
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Deliver one event to every sink
    pub async fn emit(&self, event: &CanonicalEvent) -> Delivery {
        let mut delivery = Delivery::default();

        for sink in &self.sinks {
            let result = match tokio::time::timeout(self.timeout, sink.emit(event)).await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Timeout),
            };

            if let Some(m) = Metrics::get() {
                let outcome = match &result {
                    Ok(()) => "ok",
                    Err(SinkError::Timeout) => "timeout",
                    Err(_) => "error",
                };
                m.record_sink_delivery(sink.name(), outcome);
            }

            match result {
                Ok(()) => {
                    delivery.delivered += 1;
                    debug!(sink = sink.name(), id = %event.id, "Delivered");
                }
                Err(e) => {
                    delivery.failed += 1;
                    warn!(
                        sink = sink.name(),
                        category = %event.category,
                        id = %event.id,
                        error = %e,
                        "Sink delivery failed"
                    );
                    self.health.record(event.category, Outcome::SinkUnavailable);
                }
            }
        }

        delivery
    }

    /// Run every sink's shutdown hook; failures are logged
    pub async fn shutdown(&self) {
        for sink in &self.sinks {
            match tokio::time::timeout(self.timeout, sink.shutdown()).await {
                Ok(Ok(())) => debug!(sink = sink.name(), "Sink shut down"),
                Ok(Err(e)) => warn!(sink = sink.name(), error = %e, "Sink shutdown failed"),
                Err(_) => warn!(sink = sink.name(), "Sink shutdown timed out"),
            }
        }
    }
}
