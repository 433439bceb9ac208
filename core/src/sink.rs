//! Sink trait for vahti destinations
//!
//! The [`Sink`] trait defines the interface for delivering canonical events to
//! an observability backend. Sinks are the output side of the pipeline; every
//! registered sink receives every event in a fan-out pattern.

use crate::error::SinkError;
use crate::event::CanonicalEvent;
use async_trait::async_trait;

/// Sink trait - delivers canonical events to a destination
///
/// # Implementation Requirements
///
/// - Sinks must be `Send + Sync`; the same sink serves every category's poller
/// - `emit` must tolerate being called twice for the same event without
///   corrupting state (counters increment, they are never set)
/// - Health checks should be lightweight
///
/// # Example
///
/// ```ignore
/// use vahti_core::{CanonicalEvent, Sink, SinkError};
/// use async_trait::async_trait;
///
/// struct LogSink;
///
/// #[async_trait]
/// impl Sink for LogSink {
///     fn name(&self) -> &'static str {
///         "log"
///     }
///
///     async fn emit(&self, event: &CanonicalEvent) -> Result<(), SinkError> {
///         tracing::info!(id = %event.id, "event");
///         Ok(())
///     }
///
///     async fn health(&self) -> bool {
///         true
///     }
/// }
/// ```
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in logs and metric labels, e.g. "annotations", "metrics"
    fn name(&self) -> &'static str;

    /// Deliver one event
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The destination accepted the event
    /// * `Err(SinkError)` - Delivery failed; the caller logs and moves on
    async fn emit(&self, event: &CanonicalEvent) -> Result<(), SinkError>;

    /// Check if the destination is healthy and accepting events
    async fn health(&self) -> bool;

    /// Graceful shutdown
    ///
    /// Called once when the bridge stops. The default implementation returns
    /// `Ok(())` for sinks that hold nothing worth flushing.
    async fn shutdown(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
