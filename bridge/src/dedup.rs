//! Deduplication and ordering for one category's event stream
//!
//! Poll windows overlap by design: the lower bound of each window is the
//! timestamp of the newest event already delivered, so events sharing that
//! timestamp are fetched again. The buffer only has to remember the ids at
//! that single boundary timestamp.
//!
//! ```text
//! window 1: [0, 15]   A@10 B@10 C@12        → emit A B C   cursor {12, {C}}
//! window 2: [12, 40]  C@12 D@12 E@20        → emit D E     cursor {20, {E}}
//! ```
//!
//! Events older than the boundary cannot be new by construction of the
//! window, so they are dropped as stale.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use vahti_core::CanonicalEvent;

/// Per-category watermark
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollCursor {
    pub last_seen_timestamp: DateTime<Utc>,
    /// Ids delivered at exactly `last_seen_timestamp`
    pub last_seen_ids: HashSet<String>,
}

impl PollCursor {
    pub fn starting_at(ts: DateTime<Utc>) -> Self {
        Self {
            last_seen_timestamp: ts,
            last_seen_ids: HashSet::new(),
        }
    }
}

/// A batch after dedup and ordering
#[derive(Debug, Default)]
pub struct Admitted {
    /// Net-new events, ascending by (timestamp, id)
    pub events: Vec<CanonicalEvent>,
    /// Already delivered at the boundary, repeated within the batch, or stale
    pub duplicates: usize,
}

/// Dedup/ordering state owned by one poller
#[derive(Debug)]
pub struct DedupBuffer {
    cursor: PollCursor,
}

impl DedupBuffer {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            cursor: PollCursor::starting_at(start),
        }
    }

    pub fn cursor(&self) -> &PollCursor {
        &self.cursor
    }

    /// False if the event was already delivered at the boundary or predates it
    pub fn admit(&self, event: &CanonicalEvent) -> bool {
        if event.timestamp < self.cursor.last_seen_timestamp {
            return false;
        }
        !(event.timestamp == self.cursor.last_seen_timestamp
            && self.cursor.last_seen_ids.contains(&event.id))
    }

    /// Order a normalized batch and keep only net-new events
    ///
    /// Ties at the same timestamp are ordered by id. An id repeated within
    /// the batch is kept once (its earliest occurrence).
    pub fn admit_batch(&self, mut batch: Vec<CanonicalEvent>) -> Admitted {
        batch.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let mut seen_in_batch = HashSet::with_capacity(batch.len());
        let mut admitted = Admitted::default();
        for event in batch {
            if self.admit(&event) && seen_in_batch.insert(event.id.clone()) {
                admitted.events.push(event);
            } else {
                admitted.duplicates += 1;
            }
        }
        admitted
    }

    /// Move the cursor past a delivered batch
    ///
    /// A newer max timestamp replaces the boundary id set; the same timestamp
    /// extends it. The cursor never moves backwards.
    pub fn advance<'a>(&mut self, delivered: impl IntoIterator<Item = &'a CanonicalEvent>) {
        let mut max: Option<DateTime<Utc>> = None;
        let mut ids_at_max: HashSet<String> = HashSet::new();
        for event in delivered {
            match max {
                Some(m) if event.timestamp < m => {}
                Some(m) if event.timestamp == m => {
                    ids_at_max.insert(event.id.clone());
                }
                _ => {
                    max = Some(event.timestamp);
                    ids_at_max.clear();
                    ids_at_max.insert(event.id.clone());
                }
            }
        }

        let Some(max) = max else { return };
        if max > self.cursor.last_seen_timestamp {
            self.cursor = PollCursor {
                last_seen_timestamp: max,
                last_seen_ids: ids_at_max,
            };
        } else if max == self.cursor.last_seen_timestamp {
            self.cursor.last_seen_ids.extend(ids_at_max);
        }
    }

    /// Reset to `now` with no remembered ids
    pub fn resync(&mut self, now: DateTime<Utc>) {
        self.cursor = PollCursor::starting_at(now);
    }
}
