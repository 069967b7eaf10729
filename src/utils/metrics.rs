//! Observability and Metrics
//!
//! Per-engine counters for traffic, failures and connection lifecycle.
//!
//! Uses atomic counters so the read loop, the writer and callers can record without locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters owned by one engine
#[derive(Debug)]
pub struct Metrics {
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    /// Frames that could not be opened
    pub decrypt_failures: AtomicU64,
    /// Bodies the registry failed to decode
    pub decode_failures: AtomicU64,
    /// Commands without a registered decoder
    pub unknown_packets: AtomicU64,
    pub requests: AtomicU64,
    /// Requests that exhausted all attempts
    pub timeouts: AtomicU64,
    /// Retransmissions after an attempt timed out
    pub retries: AtomicU64,
    pub connects: AtomicU64,
    pub connect_failures: AtomicU64,
    pub handshakes: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            decrypt_failures: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            unknown_packets: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            handshakes: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn frame_received(&self, byte_count: usize) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, byte_count: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(byte_count as u64, Ordering::Relaxed);
    }

    pub fn decrypt_failure(&self) {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_packet(&self) {
        self.unknown_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake(&self) {
        self.handshakes.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            unknown_packets: self.unknown_packets.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            handshakes: self.handshakes.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            frames_in = s.frames_in,
            frames_out = s.frames_out,
            bytes_in = s.bytes_in,
            bytes_out = s.bytes_out,
            decrypt_failures = s.decrypt_failures,
            decode_failures = s.decode_failures,
            unknown_packets = s.unknown_packets,
            requests = s.requests,
            timeouts = s.timeouts,
            retries = s.retries,
            connects = s.connects,
            connect_failures = s.connect_failures,
            handshakes = s.handshakes,
            uptime_seconds = s.uptime_seconds,
            "Engine metrics snapshot"
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
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub decrypt_failures: u64,
    pub decode_failures: u64,
    pub unknown_packets: u64,
    pub requests: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub connects: u64,
    pub connect_failures: u64,
    pub handshakes: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.frame_received(20);
        metrics.frame_received(30);
        metrics.frame_sent(7);
        metrics.retry();
        let snap = metrics.snapshot();
        assert_eq!(snap.frames_in, 2);
        assert_eq!(snap.bytes_in, 50);
        assert_eq!(snap.bytes_out, 7);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.timeouts, 0);
    }
}
