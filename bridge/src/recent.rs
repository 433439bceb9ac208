//! Bounded per-category history of emitted events
//!
//! Backs `latest_events` for on-demand browsing. Nothing here is persisted.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use vahti_core::{CanonicalEvent, Category};

pub struct RecentEvents {
    capacity: usize,
    rings: RwLock<HashMap<Category, VecDeque<CanonicalEvent>>>,
}

impl RecentEvents {
    /// `capacity` events are kept per category (at least one)
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: RwLock::new(HashMap::new()),
        }
    }

    pub fn push(&self, event: CanonicalEvent) {
        let mut rings = self.rings.write();
        let ring = rings
            .entry(event.category)
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    /// Up to `limit` events, most recent first
    pub fn latest(&self, category: Category, limit: usize) -> Vec<CanonicalEvent> {
        self.rings
            .read()
            .get(&category)
            .map(|ring| ring.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, category: Category) -> usize {
        self.rings.read().get(&category).map_or(0, VecDeque::len)
    }
}
