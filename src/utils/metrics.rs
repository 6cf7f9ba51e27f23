//! Observability and Metrics
//!
//! Counters for frames crossing the link and for the connections and
//! requests multiplexed over it.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector shared by every engine component
#[derive(Debug)]
pub struct Metrics {
    /// Frames written to the transport
    pub frames_sent: AtomicU64,
    /// Frames decoded from the transport
    pub frames_received: AtomicU64,
    /// Bytes written to the transport, headers included
    pub bytes_sent: AtomicU64,
    /// Bytes decoded from the transport, headers included
    pub bytes_received: AtomicU64,
    /// Frames the duplexer failed to write
    pub write_failures: AtomicU64,
    /// Tunneled connections opened
    pub connections_opened: AtomicU64,
    /// Tunneled connections closed
    pub connections_closed: AtomicU64,
    /// Requests sent through the correlator
    pub requests_sent: AtomicU64,
    /// Requests that never got a response in time
    pub requests_timed_out: AtomicU64,
    /// Responses matched to a waiter
    pub responses_delivered: AtomicU64,
    /// Responses with no waiter (late or unknown)
    pub responses_discarded: AtomicU64,
    /// Frames dropped as malformed or unroutable
    pub invalid_frames: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            responses_delivered: AtomicU64::new(0),
            responses_discarded: AtomicU64::new(0),
            invalid_frames: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn write_failed(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timed_out(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_delivered(&self) {
        self.responses_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_discarded(&self) {
        self.responses_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalid_frame(&self) {
        self.invalid_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections opened and not yet closed
    pub fn connections_active(&self) -> u64 {
        self.connections_opened
            .load(Ordering::Relaxed)
            .saturating_sub(self.connections_closed.load(Ordering::Relaxed))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_active: self.connections_active(),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            responses_delivered: self.responses_delivered.load(Ordering::Relaxed),
            responses_discarded: self.responses_discarded.load(Ordering::Relaxed),
            invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
            uptime_secs: self.uptime_secs(),
        }
    }

    /// Log a one-line summary of all counters
    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            frames_sent = s.frames_sent,
            frames_received = s.frames_received,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            write_failures = s.write_failures,
            connections_opened = s.connections_opened,
            connections_active = s.connections_active,
            requests_sent = s.requests_sent,
            requests_timed_out = s.requests_timed_out,
            responses_discarded = s.responses_discarded,
            invalid_frames = s.invalid_frames,
            uptime_secs = s.uptime_secs,
            "Tunnel metrics"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub write_failures: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connections_active: u64,
    pub requests_sent: u64,
    pub requests_timed_out: u64,
    pub responses_delivered: u64,
    pub responses_discarded: u64,
    pub invalid_frames: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_frames_and_bytes() {
        let metrics = Metrics::new();
        metrics.frame_sent(10);
        metrics.frame_sent(5);
        metrics.frame_received(7);

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.bytes_received, 7);
    }

    #[test]
    fn active_connections_never_underflow() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        metrics.connection_closed();
        metrics.connection_closed();
        assert_eq!(metrics.connections_active(), 0);
    }
}
