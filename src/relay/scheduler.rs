//! Relay scheduler
//!
//! Bounded broadcast queue with at most one broadcast candidate per
//! originating user, plus a separate slot for the local device's own
//! broadcast. A private message occupies its own `(user, target)` slot so it
//! never displaces the sender's broadcast. Each tick
//! yields the single packet to transmit next:
//!
//! - even ticks prefer the own broadcast, falling back to the relay queue
//! - odd ticks walk the relay queue round-robin, falling back to the own broadcast
//!
//! A Safe packet removes its user from the queue and tombstones the user so no
//! further activity for them is relayed within the freshness window.
//!
//! The scheduler is a plain state machine. It never touches the radio or the
//! store; the coordinator drives it.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::config::{DEFAULT_MAX_AGE, DEFAULT_QUEUE_CEILING};
use crate::core::packet::{sequence_is_newer, SosPacket, UniqueId};

/// A relay candidate
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub packet: SosPacket,
    /// Higher is more urgent
    pub priority: u8,
}

/// What [`RelayScheduler::enqueue`] did with a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New candidate for a user not yet queued
    Inserted,
    /// New candidate inserted after evicting the oldest one
    InsertedWithEviction(UniqueId),
    /// Replaced the queued candidate in the same slot
    Replaced,
    /// Not newer than the queued candidate in the same slot
    Stale,
    /// Safe packet removed the user's candidate
    Removed,
    /// User was announced Safe; nothing is relayed for them
    Suppressed,
    /// Own packets are never relayed as a peer's
    SelfExcluded,
}

/// What the tick selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSource {
    Own,
    Relay,
}

#[derive(Debug)]
pub struct RelayScheduler {
    local_user_id: u32,
    /// Insertion-ordered candidates, oldest first
    queue: VecDeque<QueueEntry>,
    own_broadcast: Option<SosPacket>,
    /// Users announced Safe, with the time of the announcement
    tombstones: HashMap<u32, Instant>,
    ceiling: usize,
    tombstone_ttl: Duration,
    tick: u64,
    cursor: usize,
}

impl RelayScheduler {
    /// Scheduler with the default ceiling and tombstone window
    pub fn new(local_user_id: u32) -> Self {
        Self::with_settings(local_user_id, DEFAULT_QUEUE_CEILING, DEFAULT_MAX_AGE)
    }

    pub fn with_settings(local_user_id: u32, ceiling: usize, tombstone_ttl: Duration) -> Self {
        Self {
            local_user_id,
            queue: VecDeque::with_capacity(ceiling.min(1024)),
            own_broadcast: None,
            tombstones: HashMap::new(),
            ceiling: ceiling.max(1),
            tombstone_ttl,
            tick: 0,
            cursor: 0,
        }
    }

    pub fn local_user_id(&self) -> u32 {
        self.local_user_id
    }

    /// Offer a packet heard from a peer
    pub fn enqueue(&mut self, packet: SosPacket, priority: u8) -> EnqueueOutcome {
        if packet.user_id == self.local_user_id {
            return EnqueueOutcome::SelfExcluded;
        }

        if packet.status.is_terminal() {
            self.tombstones.insert(packet.user_id, Instant::now());
            return if self.remove_user(packet.user_id) {
                EnqueueOutcome::Removed
            } else {
                EnqueueOutcome::Suppressed
            };
        }

        if self.is_tombstoned(packet.user_id) {
            trace!(user_id = packet.user_id, "Relay suppressed for safe user");
            return EnqueueOutcome::Suppressed;
        }

        if let Some(entry) = self
            .queue
            .iter_mut()
            .find(|e| slot(&e.packet) == slot(&packet))
        {
            if sequence_is_newer(packet.sequence, entry.packet.sequence) {
                *entry = QueueEntry { packet, priority };
                return EnqueueOutcome::Replaced;
            }
            return EnqueueOutcome::Stale;
        }

        let mut outcome = EnqueueOutcome::Inserted;
        if self.queue.len() >= self.ceiling {
            if let Some(evicted) = self.queue.pop_front() {
                let id = evicted.packet.unique_id();
                warn!(evicted = %id, ceiling = self.ceiling, "Relay queue full, dropping oldest");
                outcome = EnqueueOutcome::InsertedWithEviction(id);
                self.cursor = self.cursor.saturating_sub(1);
            }
        }
        self.queue.push_back(QueueEntry { packet, priority });
        outcome
    }

    /// Remove every candidate from `user_id`. Returns whether any was queued.
    pub fn remove_user(&mut self, user_id: u32) -> bool {
        let mut removed = false;
        while let Some(index) = self.queue.iter().position(|e| e.packet.user_id == user_id) {
            self.queue.remove(index);
            if index < self.cursor {
                self.cursor -= 1;
            }
            removed = true;
        }
        if removed {
            debug!(user_id, "Relay candidates removed");
        }
        removed
    }

    /// Whether relaying for `user_id` is blocked by an earlier Safe
    pub fn is_tombstoned(&self, user_id: u32) -> bool {
        self.tombstones
            .get(&user_id)
            .is_some_and(|at| at.elapsed() < self.tombstone_ttl)
    }

    /// Drop expired tombstones. Returns how many were removed.
    pub fn prune_tombstones(&mut self) -> usize {
        let before = self.tombstones.len();
        let ttl = self.tombstone_ttl;
        self.tombstones.retain(|_, at| at.elapsed() < ttl);
        before - self.tombstones.len()
    }

    /// Drop candidates older than `max_age_secs`. Returns how many were removed.
    pub fn drop_expired(&mut self, now: u64, max_age_secs: u64) -> usize {
        let before = self.queue.len();
        self.queue
            .retain(|e| !e.packet.is_expired_at(now, max_age_secs));
        let removed = before - self.queue.len();
        if removed > 0 {
            self.cursor = 0;
            debug!(removed, "Expired relay candidates dropped");
        }
        removed
    }

    pub fn set_own_broadcast(&mut self, packet: SosPacket) {
        self.own_broadcast = Some(packet);
    }

    pub fn clear_own_broadcast(&mut self) -> Option<SosPacket> {
        self.own_broadcast.take()
    }

    pub fn own_broadcast(&self) -> Option<&SosPacket> {
        self.own_broadcast.as_ref()
    }

    /// Whether a tick would transmit anything
    pub fn has_work(&self) -> bool {
        self.own_broadcast.is_some() || !self.queue.is_empty()
    }

    /// Select the packet for this tick and advance the tick counter
    pub fn next_tick(&mut self) -> Option<(TickSource, SosPacket)> {
        let tick = self.tick;
        self.tick = self.tick.wrapping_add(1);

        let selection = if tick % 2 == 0 {
            self.own().or_else(|| self.next_relay())
        } else {
            self.next_relay().or_else(|| self.own())
        };

        if let Some((source, ref packet)) = selection {
            trace!(tick, ?source, id = %packet.unique_id(), "Tick selected packet");
        }
        selection
    }

    fn own(&self) -> Option<(TickSource, SosPacket)> {
        self.own_broadcast
            .clone()
            .map(|packet| (TickSource::Own, packet))
    }

    fn next_relay(&mut self) -> Option<(TickSource, SosPacket)> {
        if self.queue.is_empty() {
            self.cursor = 0;
            return None;
        }
        let index = self.cursor % self.queue.len();
        self.cursor = (index + 1) % self.queue.len();
        self.queue
            .get(index)
            .map(|entry| (TickSource::Relay, entry.packet.clone()))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains_user(&self, user_id: u32) -> bool {
        self.queue.iter().any(|e| e.packet.user_id == user_id)
    }

    /// Candidates in insertion order, oldest first
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.queue.iter().cloned().collect()
    }

    /// Forget all candidates and the own broadcast. Tombstones survive.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.own_broadcast = None;
        self.cursor = 0;
    }
}

/// Queue slot of a packet: the sender's broadcast, or one private conversation
fn slot(packet: &SosPacket) -> (u32, u32) {
    (packet.user_id, packet.target_id)
}
