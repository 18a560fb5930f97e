//! Per-connection traffic metrics
//!
//! Atomic counters shared by the sender, receiver and monitor tasks of one
//! connection. The monitor samples `total_bytes()` for idle detection and
//! `since_last_activity()` backs `Connection::is_transmitting()`.

use crate::core::parcel::ParcelKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Traffic counters of one connection
#[derive(Debug)]
pub struct TransferMetrics {
    /// Total bytes written to the socket, headers included
    pub bytes_sent: AtomicU64,
    /// Total bytes read from the socket, headers included
    pub bytes_received: AtomicU64,
    /// Parcels written
    pub parcels_sent: AtomicU64,
    /// Parcels read
    pub parcels_received: AtomicU64,
    /// Signal parcels written
    pub signals_sent: AtomicU64,
    /// Signal parcels read
    pub signals_received: AtomicU64,
    /// Objects fully written
    pub objects_sent: AtomicU64,
    /// Objects fully reassembled and delivered
    pub objects_received: AtomicU64,
    /// Files fully streamed out
    pub files_sent: AtomicU64,
    /// Files fully received
    pub files_received: AtomicU64,
    /// Milliseconds after `start_time` of the latest socket activity
    last_activity_ms: AtomicU64,
    start_time: Instant,
}

impl TransferMetrics {
    /// Create a new, zeroed collector
    pub fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            parcels_sent: AtomicU64::new(0),
            parcels_received: AtomicU64::new(0),
            signals_sent: AtomicU64::new(0),
            signals_received: AtomicU64::new(0),
            objects_sent: AtomicU64::new(0),
            objects_received: AtomicU64::new(0),
            files_sent: AtomicU64::new(0),
            files_received: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a parcel written to the socket
    pub fn parcel_sent(&self, kind: ParcelKind, wire_len: usize) {
        self.parcels_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(wire_len as u64, Ordering::Relaxed);
        if kind == ParcelKind::Signal {
            self.signals_sent.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
    }

    /// Record a parcel read from the socket
    pub fn parcel_received(&self, kind: ParcelKind, wire_len: usize) {
        self.parcels_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(wire_len as u64, Ordering::Relaxed);
        if kind == ParcelKind::Signal {
            self.signals_received.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
    }

    /// Record a completely sent object
    pub fn object_sent(&self) {
        self.objects_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completely received object
    pub fn object_received(&self) {
        self.objects_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completely sent file
    pub fn file_sent(&self) {
        self.files_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completely received file
    pub fn file_received(&self) {
        self.files_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes exchanged in both directions
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed) + self.bytes_received.load(Ordering::Relaxed)
    }

    /// Time since the latest parcel was written or read
    pub fn since_last_activity(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.start_time.elapsed().saturating_sub(last)
    }

    fn touch(&self) {
        let now = self.start_time.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            parcels_sent: self.parcels_sent.load(Ordering::Relaxed),
            parcels_received: self.parcels_received.load(Ordering::Relaxed),
            signals_sent: self.signals_sent.load(Ordering::Relaxed),
            signals_received: self.signals_received.load(Ordering::Relaxed),
            objects_sent: self.objects_sent.load(Ordering::Relaxed),
            objects_received: self.objects_received.load(Ordering::Relaxed),
            files_sent: self.files_sent.load(Ordering::Relaxed),
            files_received: self.files_received.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self, connection: &str) {
        let snapshot = self.snapshot();
        info!(
            conn = connection,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            parcels_sent = snapshot.parcels_sent,
            parcels_received = snapshot.parcels_received,
            objects_sent = snapshot.objects_sent,
            objects_received = snapshot.objects_received,
            files_sent = snapshot.files_sent,
            files_received = snapshot.files_received,
            uptime_seconds = snapshot.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

impl Default for TransferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub parcels_sent: u64,
    pub parcels_received: u64,
    pub signals_sent: u64,
    pub signals_received: u64,
    pub objects_sent: u64,
    pub objects_received: u64,
    pub files_sent: u64,
    pub files_received: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = TransferMetrics::new();
        metrics.parcel_sent(ParcelKind::Object, 100);
        metrics.parcel_sent(ParcelKind::Signal, 40);
        metrics.parcel_received(ParcelKind::File, 60);

        let snap = metrics.snapshot();
        assert_eq!(snap.bytes_sent, 140);
        assert_eq!(snap.bytes_received, 60);
        assert_eq!(snap.parcels_sent, 2);
        assert_eq!(snap.signals_sent, 1);
        assert_eq!(snap.signals_received, 0);
        assert_eq!(metrics.total_bytes(), 200);
    }

    #[test]
    fn test_activity_is_recent_after_traffic() {
        let metrics = TransferMetrics::new();
        metrics.parcel_received(ParcelKind::Signal, 10);
        assert!(metrics.since_last_activity() < Duration::from_secs(1));
    }
}
