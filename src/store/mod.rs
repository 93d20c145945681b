//! # Packet Store
//!
//! Persistent, deduplicating archive of SOS packets plus the local identity.
//!
//! Construction is two-phase: [`PacketStore::new`] captures configuration,
//! [`PacketStore::initialize`] opens the database and hands back a
//! [`StoreHandle`], which is the only way to reach store operations.
//!
//! ## Concurrency
//! Every operation runs behind one `tokio::sync::Mutex` per handle, so callers
//! are served in FIFO order. [`StoreHandle::reset`] takes the same lock, which
//! means it waits for in-flight work before dropping and reopening the database.
//!
//! A mutation whose snapshot write fails is not applied: the caller gets the
//! error and the in-memory state is exactly what it was before the call.
//!
//! ## Usage
//! ```rust,no_run
//! use sos_mesh::config::StoreConfig;
//! use sos_mesh::core::packet::{SosPacket, Status};
//! use sos_mesh::store::{PacketStore, SaveOutcome};
//!
//! # async fn run() -> Result<(), sos_mesh::error::StoreError> {
//! let store = PacketStore::new(StoreConfig::at_path("/var/lib/sos/store.bin"))
//!     .initialize()
//!     .await?;
//!
//! let packet = SosPacket::new(42, 1, 37.77, -122.41, Status::Sos);
//! assert_eq!(store.save(packet).await?, SaveOutcome::New);
//! # Ok(())
//! # }
//! ```

mod database;
pub mod seen;

pub use database::{ExpirySummary, LocalIdentity, SaveOutcome, StoreStats, StoredRecord};

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::config::StoreConfig;
use crate::core::packet::{unix_now, SosPacket, UniqueId};
use crate::error::{constants, StoreError};
use database::Database;

/// Unopened store: configuration only
#[derive(Debug, Clone)]
pub struct PacketStore {
    config: StoreConfig,
}

impl PacketStore {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    /// Open the database. Failures propagate so a supervisor can retry.
    #[instrument(skip(self), fields(path = ?self.config.path))]
    pub async fn initialize(self) -> Result<StoreHandle, StoreError> {
        let db = open_database(&self.config).await?;
        info!("Packet store opened");
        Ok(StoreHandle {
            inner: Arc::new(StoreInner {
                config: self.config,
                db: Mutex::new(Some(db)),
            }),
        })
    }
}

async fn open_database(config: &StoreConfig) -> Result<Database, StoreError> {
    match config.path.as_deref() {
        Some(path) => Database::load(path).await,
        None => Ok(Database::in_memory()),
    }
}

fn generate_user_id() -> Result<u32, StoreError> {
    loop {
        let mut bytes = [0u8; 4];
        getrandom::fill(&mut bytes)
            .map_err(|e| StoreError::Custom(format!("{}: {e}", constants::ERR_IDENTITY_ENTROPY)))?;
        let id = u32::from_be_bytes(bytes);
        // 0 is the broadcast target
        if id != 0 {
            return Ok(id);
        }
    }
}

struct StoreInner {
    config: StoreConfig,
    db: Mutex<Option<Database>>,
}

/// Handle to an open packet store. Cheap to clone; clones share one database.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("path", &self.inner.config.path)
            .finish()
    }
}

impl StoreHandle {
    fn max_age(&self) -> u64 {
        self.inner.config.max_age.as_secs()
    }

    fn retention(&self) -> u64 {
        self.inner.config.retention.as_secs()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Save a packet heard on the radio
    pub async fn save(&self, packet: SosPacket) -> Result<SaveOutcome, StoreError> {
        self.save_at(packet, unix_now()).await
    }

    /// [`save`](Self::save) with an explicit clock
    #[instrument(skip(self, packet), fields(id = %packet.unique_id()))]
    pub async fn save_at(&self, packet: SosPacket, now: u64) -> Result<SaveOutcome, StoreError> {
        let max_age = self.max_age();
        let mut guard = self.inner.db.lock().await;
        let db = guard.as_mut().ok_or(StoreError::NotOpen)?;

        if db.is_seen(&packet.unique_id()) {
            debug!("Duplicate packet ignored");
            return Ok(SaveOutcome::DuplicateIgnored);
        }

        let outcome = db
            .commit(
                |db| db.save(packet, now, max_age),
                |outcome| matches!(outcome, SaveOutcome::New | SaveOutcome::SupersededExisting),
            )
            .await?;
        debug!(?outcome, "Packet saved");
        Ok(outcome)
    }

    /// Store a self-originated packet. Targeted messages pass
    /// `sync_eligible = false` so they are never uploaded.
    #[instrument(skip(self, packet), fields(id = %packet.unique_id()))]
    pub async fn save_local(&self, packet: SosPacket, sync_eligible: bool) -> Result<(), StoreError> {
        let mut guard = self.inner.db.lock().await;
        let db = guard.as_mut().ok_or(StoreError::NotOpen)?;
        let now = unix_now();
        db.commit(|db| db.save_local(packet, now, sync_eligible), |_| true)
            .await
    }

    /// Fresh peer alerts that are not Safe and not archived, newest first
    pub async fn active_packets(&self) -> Result<Vec<StoredRecord>, StoreError> {
        self.active_packets_at(unix_now()).await
    }

    pub async fn active_packets_at(&self, now: u64) -> Result<Vec<StoredRecord>, StoreError> {
        let max_age = self.max_age();
        let guard = self.inner.db.lock().await;
        let db = guard.as_ref().ok_or(StoreError::NotOpen)?;
        Ok(db.active(now, max_age))
    }

    /// Records awaiting upload by the cloud sync collaborator
    pub async fn unsynced_packets(&self) -> Result<Vec<StoredRecord>, StoreError> {
        let guard = self.inner.db.lock().await;
        let db = guard.as_ref().ok_or(StoreError::NotOpen)?;
        Ok(db.unsynced())
    }

    /// Flag records as uploaded. Returns how many records changed.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn mark_synced(&self, ids: &[UniqueId]) -> Result<usize, StoreError> {
        let mut guard = self.inner.db.lock().await;
        let db = guard.as_mut().ok_or(StoreError::NotOpen)?;
        db.commit(|db| db.mark_synced(ids), |marked| *marked > 0)
            .await
    }

    /// Archive stale records and purge anything past the retention horizon
    pub async fn expire_sweep(&self) -> Result<ExpirySummary, StoreError> {
        self.expire_sweep_at(unix_now()).await
    }

    #[instrument(skip(self))]
    pub async fn expire_sweep_at(&self, now: u64) -> Result<ExpirySummary, StoreError> {
        let (max_age, retention) = (self.max_age(), self.retention());
        let mut guard = self.inner.db.lock().await;
        let db = guard.as_mut().ok_or(StoreError::NotOpen)?;

        let summary = db
            .commit(
                |db| db.expire(now, max_age, retention),
                |summary| *summary != ExpirySummary::default(),
            )
            .await?;
        if summary != ExpirySummary::default() {
            info!(
                archived = summary.archived,
                purged_records = summary.purged_records,
                purged_seen = summary.purged_seen,
                "Expiry sweep"
            );
        }
        Ok(summary)
    }

    /// Local user id, created and persisted on first call
    pub async fn user_id(&self) -> Result<u32, StoreError> {
        Ok(self.identity().await?.user_id)
    }

    /// Local identity, created and persisted on first call
    pub async fn identity(&self) -> Result<LocalIdentity, StoreError> {
        let mut guard = self.inner.db.lock().await;
        let db = guard.as_mut().ok_or(StoreError::NotOpen)?;
        if let Some(identity) = db.identity() {
            return Ok(identity);
        }

        let user_id = generate_user_id()?;
        let identity = db
            .commit(|db| db.identity_or_create(user_id), |_| true)
            .await?;
        info!(user_id = identity.user_id, "Local identity created");
        Ok(identity)
    }

    /// Advance and persist the local sequence counter.
    ///
    /// The new value is durable before it is returned, so a crash between
    /// this call and the transmission never reuses a sequence number.
    pub async fn increment_sequence(&self) -> Result<u16, StoreError> {
        let mut guard = self.inner.db.lock().await;
        let db = guard.as_mut().ok_or(StoreError::NotOpen)?;
        let user_id = match db.local_user_id() {
            Some(id) => id,
            None => generate_user_id()?,
        };
        let sequence = db.commit(|db| db.bump_sequence(user_id), |_| true).await?;
        debug!(user_id, sequence, "Sequence incremented");
        Ok(sequence)
    }

    /// Current broadcast record for `user_id`. Private messages are not
    /// considered.
    pub async fn latest_for(&self, user_id: u32) -> Result<Option<StoredRecord>, StoreError> {
        let guard = self.inner.db.lock().await;
        let db = guard.as_ref().ok_or(StoreError::NotOpen)?;
        Ok(db.latest_for(user_id))
    }

    pub async fn is_seen(&self, id: UniqueId) -> Result<bool, StoreError> {
        let guard = self.inner.db.lock().await;
        let db = guard.as_ref().ok_or(StoreError::NotOpen)?;
        Ok(db.is_seen(&id))
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let guard = self.inner.db.lock().await;
        let db = guard.as_ref().ok_or(StoreError::NotOpen)?;
        Ok(db.stats())
    }

    /// Flush and close. Later operations fail with [`StoreError::NotOpen`].
    pub async fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.db.lock().await;
        if let Some(db) = guard.take() {
            db.flush().await?;
            info!("Packet store closed");
        }
        Ok(())
    }

    /// Drop the open database and reopen it from its snapshot.
    ///
    /// Waits for every in-flight operation first. An in-memory store comes
    /// back empty. Open failures propagate and leave the store closed.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.db.lock().await;
        if let Some(db) = guard.as_ref() {
            db.flush().await?;
        }
        *guard = None;
        let db = open_database(&self.inner.config).await?;
        *guard = Some(db);
        info!("Packet store reopened");
        Ok(())
    }
}
