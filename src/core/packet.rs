//! SOS packet model
//!
//! An [`SosPacket`] is an immutable value object. It is created by the
//! originating device, carried byte-for-byte by every relay, and only ever
//! superseded by a later `sequence` from the same `user_id`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Target id meaning "everyone".
pub const BROADCAST_TARGET: u32 = 0;

/// Alert status carried on the wire as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Terminal status. Kills propagation for the originating user.
    Safe,
    Sos,
    Medical,
    Trapped,
    SuppliesNeeded,
    Injured,
}

impl Status {
    /// Wire code for this status
    pub fn code(self) -> u8 {
        match self {
            Status::Safe => 0,
            Status::Sos => 1,
            Status::Medical => 2,
            Status::Trapped => 3,
            Status::SuppliesNeeded => 4,
            Status::Injured => 5,
        }
    }

    /// Parse a wire code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Status::Safe),
            1 => Some(Status::Sos),
            2 => Some(Status::Medical),
            3 => Some(Status::Trapped),
            4 => Some(Status::SuppliesNeeded),
            5 => Some(Status::Injured),
            _ => None,
        }
    }

    /// Whether this status ends an alert
    pub fn is_terminal(self) -> bool {
        self == Status::Safe
    }

    /// Relay priority hint, higher is more urgent
    pub fn severity(self) -> u8 {
        match self {
            Status::Safe => 0,
            Status::SuppliesNeeded => 1,
            Status::Sos => 2,
            Status::Injured => 3,
            Status::Trapped => 4,
            Status::Medical => 5,
        }
    }

    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            Status::Safe => "safe",
            Status::Sos => "sos",
            Status::Medical => "medical",
            Status::Trapped => "trapped",
            Status::SuppliesNeeded => "supplies_needed",
            Status::Injured => "injured",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dedup key of a packet: `(user_id, sequence)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueId {
    pub user_id: u32,
    pub sequence: u16,
}

impl UniqueId {
    pub fn new(user_id: u32, sequence: u16) -> Self {
        Self { user_id, sequence }
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{}", self.user_id, self.sequence)
    }
}

/// A distress signal as it travels across the mesh.
///
/// `rssi` is the signal strength of the last hop. It is attached locally on
/// receipt, never transmitted, and ignored by equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SosPacket {
    pub user_id: u32,
    pub sequence: u16,
    pub latitude: f64,
    pub longitude: f64,
    pub status: Status,
    /// Unix seconds
    pub timestamp: u32,
    /// 0 for broadcast, otherwise the only recipient that surfaces it
    pub target_id: u32,
    #[serde(skip)]
    pub rssi: Option<i32>,
}

impl SosPacket {
    /// Build a broadcast packet stamped with the current time
    pub fn new(user_id: u32, sequence: u16, latitude: f64, longitude: f64, status: Status) -> Self {
        Self {
            user_id,
            sequence,
            latitude,
            longitude,
            status,
            timestamp: unix_now() as u32,
            target_id: BROADCAST_TARGET,
            rssi: None,
        }
    }

    /// Restrict this packet to a single recipient
    pub fn with_target(mut self, target_id: u32) -> Self {
        self.target_id = target_id;
        self
    }

    /// Override the creation timestamp
    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach the last-hop signal strength
    pub fn with_rssi(mut self, rssi: i32) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn unique_id(&self) -> UniqueId {
        UniqueId::new(self.user_id, self.sequence)
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_id == BROADCAST_TARGET
    }

    pub fn is_targeted(&self) -> bool {
        !self.is_broadcast()
    }

    /// Whether a device with `local_id` should surface this packet
    pub fn is_addressed_to(&self, local_id: u32) -> bool {
        self.is_broadcast() || self.target_id == local_id
    }

    /// Whether the packet is older than `max_age_secs` relative to `now`
    pub fn is_expired_at(&self, now: u64, max_age_secs: u64) -> bool {
        now.saturating_sub(u64::from(self.timestamp)) > max_age_secs
    }
}

impl PartialEq for SosPacket {
    fn eq(&self, other: &Self) -> bool {
        self.user_id == other.user_id
            && self.sequence == other.sequence
            && self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.status == other.status
            && self.timestamp == other.timestamp
            && self.target_id == other.target_id
    }
}

/// Whether `candidate` follows `current` in the wrapping `u16` sequence space.
///
/// Serial number arithmetic: `candidate` is newer when it lies less than half
/// the space ahead of `current`, so a counter that wraps past 65535 keeps
/// superseding its earlier packets.
pub fn sequence_is_newer(candidate: u16, current: u16) -> bool {
    candidate != current && candidate.wrapping_sub(current) < 0x8000
}

/// Current Unix time in seconds. A clock before the epoch reads as 0.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
