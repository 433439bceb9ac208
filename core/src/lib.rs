//! vahti-core - Core types for the vahti event bridge
//!
//! This crate provides the foundational types shared between the bridge
//! pipeline and the sinks it delivers to:
//!
//! - [`CanonicalEvent`] - the normalized record every upstream event becomes
//! - [`Category`] / [`Severity`] - the closed vocabularies events are tagged with
//! - [`Sink`] trait - async interface for delivering events to a destination
//! - [`SinkError`] - error type for sink operations
//!
//! # Why this crate exists
//!
//! Sinks (Grafana annotations, Prometheus counters, anything an embedder adds)
//! only need the event model and the trait. Keeping them here means a sink
//! crate never has to depend on the HTTP client, pollers and credential code
//! in `vahti-bridge`.
//!
//! ```text
//! vahti-core ◄── vahti-bridge ◄── vahti-runtime
//!     ▲
//!     └────────── third-party sinks
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod error;
/// Canonical event model
pub mod event;
mod sink;

pub use error::SinkError;
pub use event::{CanonicalEvent, Category, Severity, UnknownCategory};
pub use sink::Sink;
