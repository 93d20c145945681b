//! Multi-source verification
//!
//! An alert becomes verified once it has been heard from a threshold number of
//! distinct neighbouring devices. Confirmations are keyed by originator, so a
//! newer sequence from the same user keeps accumulating toward the same quorum.
//!
//! A Safe announcement clears the originator and leaves a marker holding the
//! Safe sequence. Alerts not newer than that marker are still in flight from
//! neighbours that missed the Safe, and never count again. State for an
//! originator not heard from within the freshness window is dropped by
//! [`VerificationTracker::prune`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{DEFAULT_MAX_AGE, DEFAULT_VERIFICATION_THRESHOLD};
use crate::core::packet::sequence_is_newer;
use crate::radio::PeerAddress;

/// Result of recording one confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Counted; quorum not reached yet
    Recorded { confirmations: usize },
    /// This confirmation reached the quorum. Reported once per originator.
    Verified,
    /// Source already counted, or the originator is already verified
    AlreadyCounted,
    /// Alert predates the originator's Safe announcement
    AfterSafe,
}

#[derive(Debug, Default)]
struct Originator {
    confirmers: HashSet<PeerAddress>,
    verified: bool,
    /// Unix seconds of the latest confirmation
    last_heard: u64,
}

#[derive(Debug, Clone, Copy)]
struct SafeMarker {
    sequence: u16,
    /// Unix seconds
    announced_at: u64,
}

#[derive(Debug)]
pub struct VerificationTracker {
    threshold: usize,
    window_secs: u64,
    originators: HashMap<u32, Originator>,
    safe: HashMap<u32, SafeMarker>,
}

impl Default for VerificationTracker {
    fn default() -> Self {
        Self::new(DEFAULT_VERIFICATION_THRESHOLD)
    }
}

impl VerificationTracker {
    /// Tracker with the default freshness window
    pub fn new(threshold: usize) -> Self {
        Self::with_window(threshold, DEFAULT_MAX_AGE)
    }

    pub fn with_window(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window_secs: window.as_secs(),
            originators: HashMap::new(),
            safe: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Count `source` as having relayed alert `sequence` from `user_id` at `now`
    pub fn record(
        &mut self,
        user_id: u32,
        sequence: u16,
        source: &PeerAddress,
        now: u64,
    ) -> Confirmation {
        if let Some(marker) = self.safe.get(&user_id) {
            if !sequence_is_newer(sequence, marker.sequence) {
                return Confirmation::AfterSafe;
            }
            // Newer than the Safe: the user needs help again
            self.safe.remove(&user_id);
        }

        let window = self.window_secs;
        let originator = self.originators.entry(user_id).or_default();
        if originator.last_heard > 0 && now.saturating_sub(originator.last_heard) > window {
            debug!(user_id, "Stale verification state reset");
            *originator = Originator::default();
        }
        originator.last_heard = now;

        if originator.verified || !originator.confirmers.insert(source.clone()) {
            return Confirmation::AlreadyCounted;
        }

        let confirmations = originator.confirmers.len();
        if confirmations >= self.threshold {
            originator.verified = true;
            info!(user_id, confirmations, "Alert verified");
            Confirmation::Verified
        } else {
            Confirmation::Recorded { confirmations }
        }
    }

    /// Clear `user_id` after a Safe announcement with `sequence`
    pub fn mark_safe(&mut self, user_id: u32, sequence: u16, now: u64) {
        self.originators.remove(&user_id);
        let marker = self.safe.entry(user_id).or_insert(SafeMarker {
            sequence,
            announced_at: now,
        });
        if sequence_is_newer(sequence, marker.sequence) {
            *marker = SafeMarker {
                sequence,
                announced_at: now,
            };
        }
    }

    pub fn is_verified(&self, user_id: u32) -> bool {
        self.originators.get(&user_id).is_some_and(|o| o.verified)
    }

    pub fn confirmations(&self, user_id: u32) -> usize {
        self.originators
            .get(&user_id)
            .map_or(0, |o| o.confirmers.len())
    }

    /// Drop everything known about `user_id`, including a Safe marker
    pub fn forget(&mut self, user_id: u32) {
        self.originators.remove(&user_id);
        self.safe.remove(&user_id);
    }

    /// Drop originators and Safe markers older than the freshness window.
    /// Returns how many entries were removed.
    pub fn prune(&mut self, now: u64) -> usize {
        let window = self.window_secs;
        let before = self.originators.len() + self.safe.len();
        self.originators
            .retain(|_, o| now.saturating_sub(o.last_heard) <= window);
        self.safe
            .retain(|_, m| now.saturating_sub(m.announced_at) <= window);
        before - self.originators.len() - self.safe.len()
    }

    pub fn verified_count(&self) -> usize {
        self.originators.values().filter(|o| o.verified).count()
    }

    /// Originators currently tracked
    pub fn len(&self) -> usize {
        self.originators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.originators.is_empty()
    }
}
