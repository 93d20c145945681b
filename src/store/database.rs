//! In-memory tables and their snapshot file
//!
//! Logical tables: broadcast records (one live record per user, unique on
//! `(user_id, sequence)`), private messages (keyed by `UniqueId`, never
//! synced), the seen log, and the local identity. The snapshot is a bincode
//! image written to `<path>.tmp` and renamed over `<path>`.
//!
//! File-backed mutations go through [`Database::commit`]: the change is made
//! on a copy and only swapped in once the snapshot is on disk.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::packet::{sequence_is_newer, SosPacket, Status, UniqueId};
use crate::error::{constants, StoreError};
use crate::store::seen::SeenLog;

const SNAPSHOT_VERSION: u8 = 1;

/// A packet as kept by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub packet: SosPacket,
    /// Unix seconds
    pub received_at: u64,
    /// Uploaded by the cloud sync collaborator
    pub is_synced: bool,
    /// Past the freshness window, kept for history
    pub is_archived: bool,
    /// Targeted messages are never uploaded
    pub sync_eligible: bool,
}

impl StoredRecord {
    pub fn unique_id(&self) -> UniqueId {
        self.packet.unique_id()
    }
}

/// Persisted `(user_id, sequence counter)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub user_id: u32,
    /// Last sequence handed out; 0 before the first packet
    pub sequence: u16,
}

/// Result of [`StoreHandle::save`](crate::store::StoreHandle::save)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// First time this packet (and a newer one for its user) is seen
    New,
    /// Replaced an older record from the same user
    SupersededExisting,
    /// Already seen, or older than the stored record for its user
    DuplicateIgnored,
    /// Older than the freshness window, not stored
    Expired,
}

/// What one expiry sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirySummary {
    pub archived: usize,
    pub purged_records: usize,
    pub purged_seen: usize,
}

/// Table sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub records: usize,
    pub archived: usize,
    pub unsynced: usize,
    pub seen: usize,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u8,
    records: Vec<StoredRecord>,
    seen: Vec<(UniqueId, u64)>,
    identity: Option<LocalIdentity>,
}

/// The open database behind a store handle
#[derive(Debug, Default, Clone)]
pub(crate) struct Database {
    records: HashMap<u32, StoredRecord>,
    /// Targeted packets, kept apart so they never supersede a broadcast
    messages: HashMap<UniqueId, StoredRecord>,
    seen: SeenLog,
    identity: Option<LocalIdentity>,
    path: Option<PathBuf>,
}

impl Database {
    pub(crate) fn in_memory() -> Self {
        Self::default()
    }

    /// Load the snapshot at `path`, or start empty if there is none yet
    pub(crate) async fn load(path: &Path) -> Result<Self, StoreError> {
        let mut db = Self {
            path: Some(path.to_path_buf()),
            ..Self::default()
        };

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No snapshot yet, starting empty");
                return Ok(db);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = bincode::deserialize(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Custom(format!(
                "{}: version {}",
                constants::ERR_STORE_SNAPSHOT,
                snapshot.version
            )));
        }

        for record in snapshot.records {
            db.insert_record(record);
        }
        db.seen = SeenLog::from_entries(snapshot.seen);
        db.identity = snapshot.identity;

        debug!(
            path = %path.display(),
            records = db.records.len(),
            messages = db.messages.len(),
            seen = db.seen.len(),
            "Snapshot loaded"
        );
        Ok(db)
    }

    /// Write the snapshot if this database is file-backed
    pub(crate) async fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        let mut records: Vec<StoredRecord> = self
            .records
            .values()
            .chain(self.messages.values())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.unique_id());
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            records,
            seen: self.seen.entries(),
            identity: self.identity,
        };
        let bytes = bincode::serialize(&snapshot)?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            warn!(error = %e, path = %path.display(), "Snapshot rename failed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Apply `change` and persist it as one unit.
    ///
    /// A file-backed database is changed on a copy that replaces `self` only
    /// after `flush` succeeds, so a failed write leaves no trace in memory.
    /// `dirty` decides from the result whether anything needs writing.
    pub(crate) async fn commit<T>(
        &mut self,
        change: impl FnOnce(&mut Self) -> T,
        dirty: impl FnOnce(&T) -> bool,
    ) -> Result<T, StoreError> {
        if self.path.is_none() {
            return Ok(change(self));
        }

        let mut next = self.clone();
        let result = change(&mut next);
        if dirty(&result) {
            next.flush().await?;
        }
        *self = next;
        Ok(result)
    }

    fn insert_record(&mut self, record: StoredRecord) {
        if record.packet.is_targeted() {
            self.messages.insert(record.unique_id(), record);
        } else {
            self.records.insert(record.packet.user_id, record);
        }
    }

    pub(crate) fn identity(&self) -> Option<LocalIdentity> {
        self.identity
    }

    /// Identity, created on first use with `user_id`
    pub(crate) fn identity_or_create(&mut self, user_id: u32) -> LocalIdentity {
        *self.identity.get_or_insert(LocalIdentity {
            user_id,
            sequence: 0,
        })
    }

    /// Advance the sequence counter, returning the new value
    pub(crate) fn bump_sequence(&mut self, user_id: u32) -> u16 {
        let identity = self.identity.get_or_insert(LocalIdentity {
            user_id,
            sequence: 0,
        });
        identity.sequence = identity.sequence.wrapping_add(1);
        identity.sequence
    }

    pub(crate) fn local_user_id(&self) -> Option<u32> {
        self.identity.map(|i| i.user_id)
    }

    /// Dedup-and-supersede write path for packets heard on the radio
    pub(crate) fn save(&mut self, packet: SosPacket, now: u64, max_age: u64) -> SaveOutcome {
        if packet.is_expired_at(now, max_age) {
            return SaveOutcome::Expired;
        }

        let id = packet.unique_id();
        if !self.seen.insert(id, now) {
            return SaveOutcome::DuplicateIgnored;
        }

        // Private messages are point-to-point: stored once, never uploaded,
        // and never compared against the sender's broadcast
        if packet.is_targeted() {
            self.messages.insert(id, Self::record(packet, now, false));
            return SaveOutcome::New;
        }

        let stored_sequence = self.records.get(&packet.user_id).map(|r| r.packet.sequence);
        let outcome = match stored_sequence {
            None => SaveOutcome::New,
            Some(stored) if sequence_is_newer(packet.sequence, stored) => {
                SaveOutcome::SupersededExisting
            }
            Some(_) => return SaveOutcome::DuplicateIgnored,
        };
        self.records
            .insert(packet.user_id, Self::record(packet, now, true));
        outcome
    }

    /// Write path for self-originated packets
    pub(crate) fn save_local(&mut self, packet: SosPacket, now: u64, sync_eligible: bool) {
        self.seen.insert(packet.unique_id(), now);
        if packet.is_targeted() {
            self.messages
                .insert(packet.unique_id(), Self::record(packet, now, false));
            return;
        }
        let newer = self
            .records
            .get(&packet.user_id)
            .map_or(true, |existing| {
                sequence_is_newer(packet.sequence, existing.packet.sequence)
            });
        if newer {
            self.records
                .insert(packet.user_id, Self::record(packet, now, sync_eligible));
        }
    }

    fn record(packet: SosPacket, now: u64, sync_eligible: bool) -> StoredRecord {
        StoredRecord {
            packet: SosPacket { rssi: None, ..packet },
            received_at: now,
            is_synced: false,
            is_archived: false,
            sync_eligible,
        }
    }

    /// Fresh, non-Safe, non-archived peer records, newest first. Private
    /// messages are included only when addressed to the local identity.
    pub(crate) fn active(&self, now: u64, max_age: u64) -> Vec<StoredRecord> {
        let local = self.local_user_id();
        let inbox = self
            .messages
            .values()
            .filter(|r| local.is_some_and(|id| r.packet.target_id == id));
        let mut active: Vec<StoredRecord> = self
            .records
            .values()
            .chain(inbox)
            .filter(|r| {
                !r.is_archived
                    && r.packet.status != Status::Safe
                    && Some(r.packet.user_id) != local
                    && !r.packet.is_expired_at(now, max_age)
            })
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.packet
                .timestamp
                .cmp(&a.packet.timestamp)
                .then(b.packet.sequence.cmp(&a.packet.sequence))
        });
        active
    }

    /// Sync-eligible records not yet uploaded, oldest first
    pub(crate) fn unsynced(&self) -> Vec<StoredRecord> {
        let mut pending: Vec<StoredRecord> = self
            .records
            .values()
            .filter(|r| r.sync_eligible && !r.is_synced)
            .cloned()
            .collect();
        pending.sort_by_key(|r| (r.received_at, r.unique_id()));
        pending
    }

    /// Flag records as uploaded. Ids that no longer match a live record are skipped.
    pub(crate) fn mark_synced(&mut self, ids: &[UniqueId]) -> usize {
        let mut marked = 0;
        for id in ids {
            if let Some(record) = self.records.get_mut(&id.user_id) {
                if record.packet.sequence == id.sequence && !record.is_synced {
                    record.is_synced = true;
                    marked += 1;
                }
            }
        }
        marked
    }

    /// Archive stale records and purge anything beyond the retention horizon
    pub(crate) fn expire(&mut self, now: u64, max_age: u64, retention: u64) -> ExpirySummary {
        let mut summary = ExpirySummary::default();

        for record in self.records.values_mut().chain(self.messages.values_mut()) {
            if !record.is_archived && record.packet.is_expired_at(now, max_age) {
                record.is_archived = true;
                summary.archived += 1;
            }
        }

        let before = self.records.len() + self.messages.len();
        self.records
            .retain(|_, r| !r.packet.is_expired_at(now, retention));
        self.messages
            .retain(|_, r| !r.packet.is_expired_at(now, retention));
        summary.purged_records = before - self.records.len() - self.messages.len();

        summary.purged_seen = self.seen.prune_before(now.saturating_sub(retention));
        summary
    }

    /// Current broadcast record for `user_id`
    pub(crate) fn latest_for(&self, user_id: u32) -> Option<StoredRecord> {
        self.records.get(&user_id).cloned()
    }

    pub(crate) fn is_seen(&self, id: &UniqueId) -> bool {
        self.seen.contains(id)
    }

    pub(crate) fn stats(&self) -> StoreStats {
        StoreStats {
            records: self.records.len() + self.messages.len(),
            archived: self
                .records
                .values()
                .chain(self.messages.values())
                .filter(|r| r.is_archived)
                .count(),
            unsynced: self
                .records
                .values()
                .filter(|r| r.sync_eligible && !r.is_synced)
                .count(),
            seen: self.seen.len(),
        }
    }
}
