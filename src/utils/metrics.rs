//! Observability counters
//!
//! Atomic counters for relay activity. One [`Metrics`] instance is owned by
//! each coordinator and shared with its transmit tasks; there is no
//! process-wide instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for relay operations
#[derive(Debug)]
pub struct Metrics {
    /// Radio frames received
    pub frames_received: AtomicU64,
    /// Frames that failed to decode
    pub decode_failures: AtomicU64,
    /// Own packets observed bounced back by a neighbor
    pub echoes: AtomicU64,
    /// New packets accepted from peers (relay hops observed)
    pub handshakes: AtomicU64,
    /// Packets the store rejected as already seen or stale
    pub duplicates: AtomicU64,
    /// Repeat scan results dropped inside one tick window
    pub scan_repeats: AtomicU64,
    /// Safe packets received from peers
    pub safe_received: AtomicU64,
    /// Alerts that reached the verification quorum
    pub alerts_verified: AtomicU64,
    /// Transmissions handed to the radio
    pub transmissions: AtomicU64,
    /// Transmissions the radio refused
    pub transmit_failures: AtomicU64,
    /// Relay candidates evicted by the queue ceiling
    pub congestion_drops: AtomicU64,
    /// Store operations that failed
    pub store_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            echoes: AtomicU64::new(0),
            handshakes: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            scan_repeats: AtomicU64::new(0),
            safe_received: AtomicU64::new(0),
            alerts_verified: AtomicU64::new(0),
            transmissions: AtomicU64::new(0),
            transmit_failures: AtomicU64::new(0),
            congestion_drops: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an echo and return the new echo count
    pub fn echo(&self) -> u64 {
        self.echoes.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a relay hop and return the new handshake count
    pub fn handshake(&self) -> u64 {
        self.handshakes.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scan_repeat(&self) {
        self.scan_repeats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn safe_received(&self) {
        self.safe_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alert_verified(&self) {
        self.alerts_verified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transmission(&self) {
        self.transmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transmit_failure(&self) {
        self.transmit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn congestion_drop(&self) {
        self.congestion_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            echoes: self.echoes.load(Ordering::Relaxed),
            handshakes: self.handshakes.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            scan_repeats: self.scan_repeats.load(Ordering::Relaxed),
            safe_received: self.safe_received.load(Ordering::Relaxed),
            alerts_verified: self.alerts_verified.load(Ordering::Relaxed),
            transmissions: self.transmissions.load(Ordering::Relaxed),
            transmit_failures: self.transmit_failures.load(Ordering::Relaxed),
            congestion_drops: self.congestion_drops.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            frames_received = snapshot.frames_received,
            decode_failures = snapshot.decode_failures,
            echoes = snapshot.echoes,
            handshakes = snapshot.handshakes,
            duplicates = snapshot.duplicates,
            scan_repeats = snapshot.scan_repeats,
            safe_received = snapshot.safe_received,
            alerts_verified = snapshot.alerts_verified,
            transmissions = snapshot.transmissions,
            transmit_failures = snapshot.transmit_failures,
            congestion_drops = snapshot.congestion_drops,
            store_errors = snapshot.store_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Relay metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub decode_failures: u64,
    pub echoes: u64,
    pub handshakes: u64,
    pub duplicates: u64,
    pub scan_repeats: u64,
    pub safe_received: u64,
    pub alerts_verified: u64,
    pub transmissions: u64,
    pub transmit_failures: u64,
    pub congestion_drops: u64,
    pub store_errors: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
