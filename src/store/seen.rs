//! Seen log for O(1) duplicate rejection
//!
//! Append-only record of `UniqueId -> first_seen_at`, kept apart from the
//! packet records so a repeat can be rejected before any record is touched.
//! Entries are pruned on a rolling window, oldest first.

use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::core::packet::UniqueId;

/// Insertion-ordered seen log with FIFO pruning
#[derive(Debug, Default, Clone)]
pub struct SeenLog {
    /// First-seen time (Unix seconds) per packet
    entries: HashMap<UniqueId, u64>,
    /// Insertion order for O(1) pruning from the front
    insertion_order: VecDeque<UniqueId>,
}

impl SeenLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted `(id, first_seen_at)` pairs in insertion order
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (UniqueId, u64)>,
    {
        let mut log = Self::new();
        for (id, seen_at) in entries {
            log.insert(id, seen_at);
        }
        log
    }

    pub fn contains(&self, id: &UniqueId) -> bool {
        self.entries.contains_key(id)
    }

    /// First-seen time of `id`, if present
    pub fn first_seen(&self, id: &UniqueId) -> Option<u64> {
        self.entries.get(id).copied()
    }

    /// Record `id` as seen at `now`. Returns false if it was already present;
    /// the original first-seen time is kept.
    pub fn insert(&mut self, id: UniqueId, now: u64) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, now);
        self.insertion_order.push_back(id);
        true
    }

    /// Drop entries first seen before `cutoff`. Returns how many were removed.
    pub fn prune_before(&mut self, cutoff: u64) -> usize {
        let initial_count = self.entries.len();

        while let Some(&id) = self.insertion_order.front() {
            match self.entries.get(&id) {
                Some(&seen_at) if seen_at >= cutoff => break,
                Some(_) => {
                    self.entries.remove(&id);
                    self.insertion_order.pop_front();
                }
                None => {
                    self.insertion_order.pop_front();
                }
            }
        }

        let removed = initial_count - self.entries.len();
        if removed > 0 {
            debug!(removed, "Pruned seen log entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order, for persistence
    pub fn entries(&self) -> Vec<(UniqueId, u64)> {
        self.insertion_order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|&t| (*id, t)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
        debug!("Seen log cleared");
    }
}
