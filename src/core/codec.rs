//! Fixed-layout wire codec for [`SosPacket`].
//!
//! Every field sits at a fixed big-endian offset. There are no variable-length
//! fields, so a frame is valid only if it is at least as long as its profile
//! and carries the profile's magic.
//!
//! ```text
//! Legacy (21 bytes, deg * 1e6, no target):
//! [Magic "SO"(2)] [User(4)] [Seq(2)] [Lat(4)] [Lon(4)] [Status(1)] [Time(4)]
//!
//! Extended (26 bytes, deg * 1e7):
//! [Magic "SE"(2)] [Ver(1)] [User(4)] [Seq(2)] [Lat(4)] [Lon(4)] [Status(1)] [Time(4)] [Target(4)]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::core::packet::{SosPacket, Status, BROADCAST_TARGET};
use crate::error::DecodeError;

/// Magic of the 21-byte advertising profile ("SO")
pub const LEGACY_MAGIC: u16 = 0x534F;

/// Magic of the extended profile ("SE")
pub const EXTENDED_MAGIC: u16 = 0x5345;

/// Current extended frame version
pub const EXTENDED_VERSION: u8 = 1;

/// Legacy frame length, bounded by short-range advertising payloads
pub const LEGACY_LEN: usize = 21;

/// Extended frame length
pub const EXTENDED_LEN: usize = 26;

const LEGACY_SCALE: f64 = 1_000_000.0;
const EXTENDED_SCALE: f64 = 10_000_000.0;

/// Wire layout selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProfile {
    /// 21-byte layout that fits in a legacy advertising payload
    #[default]
    Legacy,
    /// Longer layout with finer coordinates and a target id
    Extended,
}

impl WireProfile {
    /// Encoded length in bytes
    pub fn len(self) -> usize {
        match self {
            WireProfile::Legacy => LEGACY_LEN,
            WireProfile::Extended => EXTENDED_LEN,
        }
    }

    /// Fixed-point coordinate scale
    pub fn scale(self) -> f64 {
        match self {
            WireProfile::Legacy => LEGACY_SCALE,
            WireProfile::Extended => EXTENDED_SCALE,
        }
    }

    pub fn magic(self) -> u16 {
        match self {
            WireProfile::Legacy => LEGACY_MAGIC,
            WireProfile::Extended => EXTENDED_MAGIC,
        }
    }

    /// Smallest coordinate difference this profile can carry
    pub fn resolution(self) -> f64 {
        1.0 / self.scale()
    }

    /// The profile actually used for `packet`. Targeted packets cannot be
    /// carried by the legacy layout.
    pub fn effective_for(self, packet: &SosPacket) -> WireProfile {
        if self == WireProfile::Legacy && packet.target_id != BROADCAST_TARGET {
            WireProfile::Extended
        } else {
            self
        }
    }
}

/// Stateless codec bound to a preferred profile
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCodec {
    profile: WireProfile,
}

impl PacketCodec {
    pub fn new(profile: WireProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> WireProfile {
        self.profile
    }

    pub fn encode(&self, packet: &SosPacket) -> Bytes {
        encode(packet, self.profile)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<SosPacket, DecodeError> {
        decode(bytes)
    }
}

fn to_fixed(value: f64, limit: f64, scale: f64) -> i32 {
    let clamped = if value.is_nan() {
        0.0
    } else {
        value.clamp(-limit, limit)
    };
    (clamped * scale).round() as i32
}

fn from_fixed(value: i32, scale: f64) -> f64 {
    f64::from(value) / scale
}

/// Encode a packet. Deterministic: identical packets give identical bytes.
pub fn encode(packet: &SosPacket, profile: WireProfile) -> Bytes {
    let profile = profile.effective_for(packet);
    let scale = profile.scale();
    let mut buf = BytesMut::with_capacity(profile.len());

    buf.put_u16(profile.magic());
    if profile == WireProfile::Extended {
        buf.put_u8(EXTENDED_VERSION);
    }
    buf.put_u32(packet.user_id);
    buf.put_u16(packet.sequence);
    buf.put_i32(to_fixed(packet.latitude, 90.0, scale));
    buf.put_i32(to_fixed(packet.longitude, 180.0, scale));
    buf.put_u8(packet.status.code());
    buf.put_u32(packet.timestamp);
    if profile == WireProfile::Extended {
        buf.put_u32(packet.target_id);
    }

    debug_assert_eq!(buf.len(), profile.len());
    buf.freeze()
}

/// Decode a frame of either profile. Trailing bytes are ignored.
pub fn decode(bytes: &[u8]) -> Result<SosPacket, DecodeError> {
    if bytes.len() < 2 {
        return Err(DecodeError::Truncated {
            expected: LEGACY_LEN,
            actual: bytes.len(),
        });
    }

    let mut buf = bytes;
    let magic = buf.get_u16();
    let profile = match magic {
        LEGACY_MAGIC => WireProfile::Legacy,
        EXTENDED_MAGIC => WireProfile::Extended,
        other => return Err(DecodeError::BadMagic(other)),
    };

    if bytes.len() < profile.len() {
        return Err(DecodeError::Truncated {
            expected: profile.len(),
            actual: bytes.len(),
        });
    }

    if profile == WireProfile::Extended {
        let version = buf.get_u8();
        if version != EXTENDED_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
    }

    let scale = profile.scale();
    let user_id = buf.get_u32();
    let sequence = buf.get_u16();
    let latitude = from_fixed(buf.get_i32(), scale);
    let longitude = from_fixed(buf.get_i32(), scale);
    let status_code = buf.get_u8();
    let status = Status::from_code(status_code).ok_or(DecodeError::UnknownStatus(status_code))?;
    let timestamp = buf.get_u32();
    let target_id = match profile {
        WireProfile::Extended => buf.get_u32(),
        WireProfile::Legacy => BROADCAST_TARGET,
    };

    trace!(user_id, sequence, ?profile, "Decoded frame");

    Ok(SosPacket {
        user_id,
        sequence,
        latitude,
        longitude,
        status,
        timestamp,
        target_id,
        rssi: None,
    })
}
