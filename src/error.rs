//! # Error Types
//!
//! Error handling for the mesh relay engine.
//!
//! Nothing in this crate is fatal to the process. Every failure degrades to
//! "this particular packet or transmission did not succeed" while the
//! coordinator keeps running.
//!
//! ## Error Categories
//! - **Decode Errors**: malformed or truncated radio payloads, dropped silently
//! - **Radio Errors**: hardware off or permission revoked, retried on the next tick
//! - **Store Errors**: a single persistence operation failed, treated as "no effect"
//! - **Configuration Errors**: invalid or unreadable configuration
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use sos_mesh::core::codec::decode;
//! use sos_mesh::error::DecodeError;
//! use tracing::debug;
//!
//! match decode(&[0x00, 0x01]) {
//!     Ok(packet) => debug!(user = packet.user_id, "decoded"),
//!     Err(DecodeError::Truncated { .. }) | Err(DecodeError::BadMagic(_)) => {}
//!     Err(e) => debug!(error = %e, "dropping frame"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Store lifecycle errors
    pub const ERR_STORE_NOT_OPEN: &str = "Packet store is not open";
    pub const ERR_STORE_SNAPSHOT: &str = "Packet store snapshot is corrupt";
    pub const ERR_IDENTITY_ENTROPY: &str = "Failed to draw entropy for a new identity";

    /// Coordinator errors
    pub const ERR_COORDINATOR_STOPPED: &str = "Mesh coordinator has stopped";
    pub const ERR_TARGET_REQUIRED: &str = "Targeted messages need a non-zero target id";
    pub const ERR_SAFE_BROADCAST: &str = "Use stop_broadcasting to announce a Safe status";

    /// Radio errors
    pub const ERR_RADIO_OFF: &str = "Radio is powered off";
    pub const ERR_RADIO_PERMISSION: &str = "Radio permission was revoked";

    /// Time errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
}

/// Failure to turn radio bytes into an [`SosPacket`](crate::core::packet::SosPacket).
///
/// These are never surfaced to users: the frame is simply not ours, or was
/// clipped by the radio.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unknown frame header: {0:#06x}")]
    BadMagic(u16),

    #[error("Unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown status code: {0}")]
    UnknownStatus(u8),
}

/// Failure reported by the native radio collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Radio unavailable: {0}")]
    Unavailable(String),

    #[error("Advertising payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Radio error: {0}")]
    Other(String),
}

/// Failure of a single persistence operation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Store snapshot error: {0}")]
    Snapshot(#[from] bincode::Error),

    #[error("Packet store is not open")]
    NotOpen,

    #[error("Store error: {0}")]
    Custom(String),
}

/// MeshError is the primary error type for all coordinator operations
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Mesh coordinator has stopped")]
    CoordinatorStopped,

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using MeshError
pub type Result<T> = std::result::Result<T, MeshError>;
