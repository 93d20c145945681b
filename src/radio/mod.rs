//! # Radio seam
//!
//! The native BLE layer sits behind [`RadioLink`]. Advertising and scanning are
//! fire-and-forget: a call returns once the request is handed to the radio,
//! and failures show up as [`RadioError`] values, never panics.
//!
//! Everything the radio hears flows back as [`RadioEvent`]s through a
//! [`RadioEventSink`], normally the one handed out by
//! [`MeshHandle::radio_sink`](crate::mesh::MeshHandle::radio_sink).

pub mod memory;

pub use memory::{MemoryEther, MemoryRadio};

use bytes::Bytes;
use std::fmt;

use crate::error::RadioError;

/// Link-layer address of a neighbouring device, as reported by the radio
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeerAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Something the radio observed
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// A scan result carrying an advertising payload
    PacketReceived {
        bytes: Bytes,
        rssi: i32,
        source: PeerAddress,
    },
    /// Radio powered on/off or permission granted/revoked
    AvailabilityChanged(bool),
    /// Internet reachability as seen by the platform
    ConnectivityChanged(bool),
}

/// Control surface of the native radio
pub trait RadioLink: Send + Sync {
    /// Replace the advertised payload and (re)start advertising
    fn start_advertising(&self, payload: &[u8]) -> Result<(), RadioError>;

    fn stop_advertising(&self) -> Result<(), RadioError>;

    fn start_scanning(&self) -> Result<(), RadioError>;

    fn stop_scanning(&self) -> Result<(), RadioError>;
}

/// Receiver of radio events.
///
/// `deliver` must not block; it returns false when the event was dropped.
pub trait RadioEventSink: Send + Sync {
    fn deliver(&self, event: RadioEvent) -> bool;
}
