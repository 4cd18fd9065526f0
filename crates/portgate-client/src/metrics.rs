//! Agent-side traffic accounting
//!
//! Counters accumulate while a session is up and drain into a
//! [`TrafficReport`] on each reporting tick plus once at teardown.
//! Directions are relative to the local service: `bytes_in` arrived from
//! the relay, `bytes_out` went back to it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficReport {
    pub requests: u64,
    pub connections: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl TrafficReport {
    pub fn is_empty(&self) -> bool {
        self.requests == 0 && self.connections == 0 && self.bytes_in == 0 && self.bytes_out == 0
    }
}

/// Where periodic traffic reports go.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn record(&self, report: TrafficReport);
}

/// Default sink: structured log lines.
pub struct TracingReport;

#[async_trait]
impl ReportSink for TracingReport {
    async fn record(&self, report: TrafficReport) {
        info!(
            requests = report.requests,
            connections = report.connections,
            bytes_in = report.bytes_in,
            bytes_out = report.bytes_out,
            "tunnel traffic"
        );
    }
}

#[derive(Default)]
pub(crate) struct TrafficCounters {
    requests: AtomicU64,
    connections: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TrafficCounters {
    pub(crate) fn incr_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    /// Take the accumulated numbers, leaving zeros behind.
    pub(crate) fn drain(&self) -> TrafficReport {
        TrafficReport {
            requests: self.requests.swap(0, Ordering::Relaxed),
            connections: self.connections.swap(0, Ordering::Relaxed),
            bytes_in: self.bytes_in.swap(0, Ordering::Relaxed),
            bytes_out: self.bytes_out.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_resets() {
        let counters = TrafficCounters::default();
        counters.incr_requests();
        counters.incr_connections();
        counters.add_bytes_in(10);
        counters.add_bytes_out(25);

        let report = counters.drain();
        assert_eq!(report.requests, 1);
        assert_eq!(report.connections, 1);
        assert_eq!(report.bytes_in, 10);
        assert_eq!(report.bytes_out, 25);

        assert!(counters.drain().is_empty());
    }

    #[test]
    fn test_empty_report() {
        assert!(TrafficReport::default().is_empty());
        let report = TrafficReport {
            bytes_out: 1,
            ..TrafficReport::default()
        };
        assert!(!report.is_empty());
    }
}
