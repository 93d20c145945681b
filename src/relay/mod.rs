//! Relay decisions: what to rebroadcast next and which alerts are corroborated.

pub mod scheduler;
pub mod verification;

pub use scheduler::{EnqueueOutcome, QueueEntry, RelayScheduler, TickSource};
pub use verification::{Confirmation, VerificationTracker};
