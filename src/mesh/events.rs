//! Events published by the coordinator
//!
//! Three independent `tokio::sync::broadcast` channels, so a UI can follow
//! alerts without also draining error traffic. A lagging subscriber loses the
//! oldest events; nothing upstream ever blocks on a slow reader.

use tokio::sync::broadcast;

use crate::core::packet::{SosPacket, UniqueId};
use crate::error::{DecodeError, RadioError};
use crate::radio::PeerAddress;
use crate::utils::metrics::MetricsSnapshot;

/// Packet-level signals for the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum PacketEvent {
    /// A new or superseding alert that this device should display
    Alert {
        packet: SosPacket,
        source: PeerAddress,
        verified: bool,
    },
    /// A peer announced it is safe
    SafeAnnounced { packet: SosPacket },
    /// Our own transmission came back from a neighbour
    Echo { count: u64 },
    /// Enough distinct neighbours relayed this user's alert
    Verified { user_id: u32, confirmations: usize },
}

/// Non-fatal failures and informational drops
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorEvent {
    Decode(DecodeError),
    RadioUnavailable(RadioError),
    /// A store operation failed and had no effect
    Store(String),
    /// The relay queue was full and this candidate was evicted
    CongestionDrop(UniqueId),
}

/// Coordinator and platform state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Broadcasting(bool),
    RadioAvailability(bool),
    Connectivity(bool),
}

/// Point-in-time view of the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct MeshStats {
    pub local_user_id: u32,
    pub broadcasting: bool,
    pub radio_available: bool,
    pub online: bool,
    pub echo_count: u64,
    pub handshake_count: u64,
    pub queue_len: usize,
    pub verified_count: usize,
    pub counters: MetricsSnapshot,
}

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    pub packets: broadcast::Sender<PacketEvent>,
    pub errors: broadcast::Sender<ErrorEvent>,
    pub state: broadcast::Sender<StateEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            packets: broadcast::channel(capacity).0,
            errors: broadcast::channel(capacity).0,
            state: broadcast::channel(capacity).0,
        }
    }

    // Sends fail only when nobody is subscribed

    pub fn packet(&self, event: PacketEvent) {
        let _ = self.packets.send(event);
    }

    pub fn error(&self, event: ErrorEvent) {
        let _ = self.errors.send(event);
    }

    pub fn state(&self, event: StateEvent) {
        let _ = self.state.send(event);
    }
}
