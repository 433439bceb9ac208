//! vahti - event bridge from a UniFi controller to Grafana and Prometheus
//!
//! Polls the controller's network, access and protect APIs, normalizes what
//! comes back into [`CanonicalEvent`](vahti_core::CanonicalEvent)s and
//! delivers each new event once, in timestamp order, to every sink.
//!
//! # Pipeline
//!
//! ```text
//!               ┌─────────────── one task per category ───────────────┐
//! Controller ──►│ Ingestor ──► normalize ──► DedupBuffer ──► SinkFanout │──► annotations
//!    ▲          └───────────────────────────────┬──────────────────────┘──► metrics
//!    │                                          ▼
//! CredentialProvider                     HealthAggregator ──► /health
//! ```
//!
//! Failures stay inside the category that hit them: they are recorded in its
//! health record and the next cycle tries again.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod bridge;
pub mod config;
pub mod credentials;
pub mod dedup;
pub mod error;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod metrics_server;
pub mod poller;
pub mod pushgateway;
pub mod recent;
pub mod sink;
pub mod testing;
pub mod upstream;

pub use bridge::{Bridge, BridgeBuilder};
pub use config::{Config, LogFormat};
pub use credentials::{Credential, CredentialKind, CredentialProvider};
pub use dedup::{DedupBuffer, PollCursor};
pub use error::{ApiError, ApiErrorKind, BridgeError, ErrorKind, MalformedEvent, Result};
pub use health::{HealthAggregator, HealthRecord, Outcome};
pub use ingest::{FetchWindow, Ingestor, RawEvent, normalize};
pub use metrics_server::MetricsServer;
pub use poller::{CycleReport, EventPoller, PollerContext, PollerState};
pub use pushgateway::PushgatewayPusher;
pub use recent::RecentEvents;
pub use sink::{AnnotationSink, MetricsSink, SinkFanout};
pub use upstream::UpstreamClient;
pub use upstream::backoff::RetryPolicy;
pub use upstream::transport::{ReqwestTransport, Transport};
pub use vahti_core::{CanonicalEvent, Category, Severity, Sink, SinkError};
