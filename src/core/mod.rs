//! # Core Packet Components
//!
//! The SOS packet model and its fixed-layout wire codec.
//!
//! ## Components
//! - **Packet**: immutable alert value object and its `(user, sequence)` dedup key
//! - **Codec**: deterministic big-endian encoding in two profiles
//!
//! ## Wire Format
//! ```text
//! Legacy:   [Magic(2)] [User(4)] [Seq(2)] [Lat(4)] [Lon(4)] [Status(1)] [Time(4)]
//! Extended: [Magic(2)] [Ver(1)] ... same fields at 1e7 scale ... [Target(4)]
//! ```
//!
//! ## Robustness
//! - Decoding never panics on arbitrary input
//! - Magic bytes reject foreign advertisements sharing the radio band

pub mod codec;
pub mod packet;
