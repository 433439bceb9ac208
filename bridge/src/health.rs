//! Per-category health bookkeeping
//!
//! Each poller writes only its own category's record; any number of readers
//! (the `/health` endpoint, `Bridge::poll_health`) take snapshots. Records are
//! replaced under a short write lock, so readers never observe a torn record.

use crate::credentials::CredentialKind;
use crate::error::ErrorKind;
use crate::metrics::Metrics;
use crate::poller::PollerState;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use vahti_core::Category;

/// Failure streak at which a category is reported as degraded
pub const DEGRADED_THRESHOLD: u32 = 3;

/// What happened, as reported by a poller or the upstream client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A poll cycle fetched successfully
    PollSucceeded,
    /// A poll cycle failed before anything was emitted
    PollFailed(ErrorKind),
    /// A raw record was skipped
    MalformedEvent,
    /// A sink rejected a delivery
    SinkUnavailable,
}

/// Liveness and failure summary for one category
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorKind>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub malformed_events: u64,
    pub sink_failures: u64,
    /// Credential form that served the most recent upstream call
    pub active_credential: Option<CredentialKind>,
    pub state: PollerState,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            last_success: None,
            last_error: None,
            last_error_at: None,
            consecutive_failures: 0,
            total_failures: 0,
            malformed_events: 0,
            sink_failures: 0,
            active_credential: None,
            state: PollerState::Idle,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= DEGRADED_THRESHOLD
    }
}

/// Concurrent map of category -> health record
pub struct HealthAggregator {
    records: RwLock<HashMap<Category, HealthRecord>>,
}

impl HealthAggregator {
    /// Start every category in `Idle` with no history
    pub fn new(categories: &[Category]) -> Self {
        Self {
            records: RwLock::new(
                categories
                    .iter()
                    .map(|c| (*c, HealthRecord::new()))
                    .collect(),
            ),
        }
    }

    /// Bookkeeping for one outcome; never fails
    pub fn record(&self, category: Category, outcome: Outcome) {
        let now = Utc::now();
        let mut records = self.records.write();
        let record = records.entry(category).or_insert_with(HealthRecord::new);

        match outcome {
            Outcome::PollSucceeded => {
                record.last_success = Some(now);
                record.consecutive_failures = 0;
            }
            Outcome::PollFailed(kind) => {
                record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                record.total_failures += 1;
                record.last_error = Some(kind);
                record.last_error_at = Some(now);
            }
            Outcome::MalformedEvent => {
                record.malformed_events += 1;
                record.last_error = Some(ErrorKind::MalformedEvent);
                record.last_error_at = Some(now);
            }
            Outcome::SinkUnavailable => {
                record.sink_failures += 1;
                record.last_error = Some(ErrorKind::SinkUnavailable);
                record.last_error_at = Some(now);
            }
        }

        if let Some(m) = Metrics::get() {
            m.set_consecutive_failures(category.as_str(), record.consecutive_failures);
        }
    }

    /// Note which credential form served the category
    pub fn record_credential(&self, category: Category, kind: CredentialKind) {
        self.records
            .write()
            .entry(category)
            .or_insert_with(HealthRecord::new)
            .active_credential = Some(kind);
    }

    pub fn set_state(&self, category: Category, state: PollerState) {
        self.records
            .write()
            .entry(category)
            .or_insert_with(HealthRecord::new)
            .state = state;
    }

    pub fn get(&self, category: Category) -> Option<HealthRecord> {
        self.records.read().get(&category).cloned()
    }

    /// Consistent copy of every record, ordered by category
    pub fn snapshot(&self) -> BTreeMap<Category, HealthRecord> {
        self.records
            .read()
            .iter()
            .map(|(c, r)| (*c, r.clone()))
            .collect()
    }

    /// True when any category has reached the failure threshold
    pub fn is_degraded(&self) -> bool {
        self.records.read().values().any(HealthRecord::is_degraded)
    }
}
