//! Ingestors: per-category fetch and normalization
//!
//! Each category knows how to pull raw records for a time window from its
//! sub-API and how to turn one raw record into a [`CanonicalEvent`].
//!
//! # Architecture
//!
//! ```text
//! UpstreamClient ──► Ingestor::fetch ──► Vec<RawEvent> ──► normalize ──► CanonicalEvent
//!                    (one per category)   (tagged)          (fixed table)
//! ```
//!
//! Normalization is pure. A record that does not fit its category's table is
//! a [`MalformedEvent`]; the poller skips it and keeps the rest of the batch.

pub mod access;
pub mod network;
pub mod protect;

use crate::error::{ApiError, ApiErrorKind, MalformedEvent, Result};
use crate::upstream::UpstreamClient;
use crate::upstream::transport::Method;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::warn;
use vahti_core::{CanonicalEvent, Category};

/// Stop paging even if the controller keeps returning full pages
pub(crate) const MAX_PAGES: usize = 50;

/// Inclusive time range a poll cycle asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }
}

/// A record as the upstream returned it, tagged with its category
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// A client record from one site's client list
    Network { site: String, record: Value },
    /// A door/reader event
    Access { record: Value },
    /// A camera, sensor or doorbell event
    Protect { record: Value },
}

impl RawEvent {
    pub fn category(&self) -> Category {
        match self {
            RawEvent::Network { .. } => Category::Network,
            RawEvent::Access { .. } => Category::Access,
            RawEvent::Protect { .. } => Category::Protect,
        }
    }

    pub fn record(&self) -> &Value {
        match self {
            RawEvent::Network { record, .. }
            | RawEvent::Access { record }
            | RawEvent::Protect { record } => record,
        }
    }
}

/// Map a raw record to its canonical form through the category's table
pub fn normalize(raw: &RawEvent) -> std::result::Result<CanonicalEvent, MalformedEvent> {
    match raw {
        RawEvent::Network { site, record } => network::normalize(site, record),
        RawEvent::Access { record } => access::normalize(record),
        RawEvent::Protect { record } => protect::normalize(record),
    }
}

/// Fetches raw records for one category
#[async_trait]
pub trait Ingestor: Send + Sync {
    fn category(&self) -> Category;

    /// Raw records in `window`
    ///
    /// Records whose timestamp parses and falls outside the window are
    /// dropped here; records without a usable timestamp are kept so the
    /// normalizer reports them.
    async fn fetch(&self, client: &UpstreamClient, window: &FetchWindow) -> Result<Vec<RawEvent>>;
}

/// The built-in ingestor for a category
pub fn ingestor_for(category: Category) -> Box<dyn Ingestor> {
    match category {
        Category::Network => Box::new(network::NetworkIngestor),
        Category::Access => Box::new(access::AccessIngestor),
        Category::Protect => Box::new(protect::ProtectIngestor),
    }
}

/// Offset-paged GET of `path`
///
/// Event feeds ask for ascending time order in `params`, so hitting
/// [`MAX_PAGES`] only defers the newest records to the next cycle. Stops on a
/// short page or once `totalCount` is reached.
pub(crate) async fn fetch_pages(
    client: &UpstreamClient,
    category: Category,
    path: &str,
    params: &[(&str, String)],
    keys: &[&str],
    page_limit: usize,
) -> Result<Vec<Value>> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    for _ in 0..MAX_PAGES {
        let mut query = params.to_vec();
        query.push(("offset", offset.to_string()));
        query.push(("limit", page_limit.to_string()));

        let page = client.call(category, Method::Get, path, &query).await?;
        let total = page.get("totalCount").and_then(Value::as_u64);
        let items = extract_items(page, keys)?;
        let count = items.len();
        records.extend(items);

        offset += count;
        if count < page_limit || total.is_some_and(|t| offset as u64 >= t) {
            return Ok(records);
        }
    }

    warn!(
        category = %category,
        path = path,
        records = records.len(),
        "Page cap reached, newer records deferred to the next cycle"
    );
    Ok(records)
}

/// Pull the record list out of a response body
///
/// Accepts a bare array or an object carrying the array under one of `keys`.
/// `null` is an empty list; any other shape is a server error.
pub(crate) fn extract_items(body: Value, keys: &[&str]) -> std::result::Result<Vec<Value>, ApiError> {
    match body {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in keys {
                match map.remove(*key) {
                    Some(Value::Array(items)) => return Ok(items),
                    Some(Value::Null) => return Ok(Vec::new()),
                    _ => {}
                }
            }
            Err(ApiError::new(
                ApiErrorKind::ServerError,
                format!("response object has no {} list", keys.join("/")),
            ))
        }
        other => Err(ApiError::new(
            ApiErrorKind::ServerError,
            format!("unexpected response shape: {}", json_type(&other)),
        )),
    }
}

/// First present key as a string; numbers are rendered
pub(crate) fn str_field(record: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match record.get(*key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// RFC 3339 string, or a unix timestamp in seconds or milliseconds
pub(crate) fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| s.parse::<i64>().ok().and_then(epoch_auto)),
        Value::Number(n) => n.as_i64().and_then(epoch_auto),
        _ => None,
    }
}

pub(crate) fn epoch_secs(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

pub(crate) fn epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

// Anything past 1e11 is millis (1e11 seconds is the year 5138)
fn epoch_auto(n: i64) -> Option<DateTime<Utc>> {
    if n.abs() >= 100_000_000_000 {
        epoch_millis(n)
    } else {
        epoch_secs(n)
    }
}

/// `smartDetectZone` -> `smart_detect_zone`
pub(crate) fn snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '-' || c == ' ' {
            out.push('_');
        } else {
            out.push(c);
        }
    }
    out
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
