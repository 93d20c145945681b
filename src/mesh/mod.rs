//! # Mesh Coordinator
//!
//! Top-level façade tying the codec, store, scheduler and radio together.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sos_mesh::config::{MeshConfig, StoreConfig};
//! use sos_mesh::core::packet::Status;
//! use sos_mesh::mesh::MeshCoordinator;
//! use sos_mesh::radio::MemoryEther;
//! use sos_mesh::store::PacketStore;
//!
//! # async fn run() -> sos_mesh::error::Result<()> {
//! let ether = MemoryEther::new();
//! let radio = ether.join("device-a");
//! let store = PacketStore::new(StoreConfig::in_memory()).initialize().await?;
//!
//! let mesh = MeshCoordinator::new(MeshConfig::default(), store, Arc::new(radio.clone()))
//!     .start()
//!     .await?;
//! radio.attach(mesh.radio_sink());
//!
//! mesh.start_broadcasting(37.7749, -122.4194, Status::Trapped).await?;
//! mesh.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod events;

pub use coordinator::{MeshCoordinator, MeshHandle};
pub use events::{ErrorEvent, MeshStats, PacketEvent, StateEvent};
