//! Canonical event model
//!
//! Every upstream record, whatever its original shape, becomes a
//! [`CanonicalEvent`] before it reaches a sink. Sinks only ever see this type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upstream sub-system an event was polled from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Network application: clients, devices, sites
    Network,
    /// Access application: doors, readers
    Access,
    /// Protect application: cameras, sensors, doorbells
    Protect,
}

impl Category {
    /// All categories in a stable order
    pub const ALL: [Category; 3] = [Category::Network, Category::Access, Category::Protect];

    /// Lowercase name used in ids, labels and tags
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Network => "network",
            Category::Access => "access",
            Category::Protect => "protect",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown category name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "network" => Ok(Category::Network),
            "access" => Ok(Category::Access),
            "protect" => Ok(Category::Protect),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

/// Event severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine activity
    Info,
    /// Worth a look (denied access, guest auth failure, sensor alarm)
    Warning,
    /// Needs attention now (forced door, camera offline)
    Critical,
}

impl Severity {
    /// Lowercase name used in labels and tags
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The normalized, category-tagged record emitted by the pipeline
///
/// `id` is `"{category}:{upstream id}"` and is stable across repeated polls of
/// the same underlying upstream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Globally unique per category + upstream id
    pub id: String,
    /// Sub-system of origin
    pub category: Category,
    /// Dotted event type, e.g. `client.connected`, `door.access_denied`
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the event happened upstream
    pub timestamp: DateTime<Utc>,
    /// Site the event belongs to (`default` when the upstream has no notion of sites)
    pub site: String,
    /// Device reference (door, camera, access point) if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Severity from the category's fixed table
    pub severity: Severity,
    /// Human-readable one-liner
    pub message: String,
    /// Category-specific attributes
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl CanonicalEvent {
    /// Build the canonical id for an upstream identifier
    pub fn make_id(category: Category, upstream_id: &str) -> String {
        format!("{}:{}", category.as_str(), upstream_id)
    }

    /// Timestamp as unix milliseconds
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Tags for point-in-time markers: category, type, severity, site
    pub fn tags(&self) -> Vec<String> {
        vec![
            self.category.as_str().to_string(),
            self.event_type.clone(),
            self.severity.as_str().to_string(),
            format!("site:{}", self.site),
        ]
    }

    /// Marker text, prefixed with the upper-cased category
    pub fn annotation_text(&self) -> String {
        format!(
            "[{}] {}",
            self.category.as_str().to_ascii_uppercase(),
            self.message
        )
    }
}
