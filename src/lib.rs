//! # sos-mesh
//!
//! Offline store-and-forward relay for emergency alerts over short-range
//! radio meshes.
//!
//! Devices advertise a compact SOS packet; every device that hears it stores
//! it once, and rebroadcasts it on a fixed cadence so it floods outward hop by
//! hop without any infrastructure.
//!
//! ## Layout
//! - [`core`]: packet model and the fixed-size wire codec
//! - [`store`]: deduplicating persistent archive and the local identity
//! - [`relay`]: relay queue, tick scheduling and multi-source verification
//! - [`radio`]: the seam to the native radio plus an in-process medium
//! - [`mesh`]: the coordinator actor that drives everything
//! - [`config`], [`error`], [`utils`]: ambient plumbing

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod core;
pub mod error;
pub mod mesh;
pub mod radio;
pub mod relay;
pub mod store;
pub mod utils;

pub use crate::config::MeshConfig;
pub use crate::core::codec::{PacketCodec, WireProfile};
pub use crate::core::packet::{SosPacket, Status, UniqueId};
pub use crate::error::{MeshError, Result};
pub use crate::mesh::{MeshCoordinator, MeshHandle};
pub use crate::store::{PacketStore, StoreHandle};
