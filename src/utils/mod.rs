//! # Utility Modules
//!
//! Logging setup and observability counters shared by the relay engine.

pub mod logging;
pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
