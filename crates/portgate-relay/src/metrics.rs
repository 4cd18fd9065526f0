//! Per-session usage counters and the sink they flush to

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Counters drained since the previous flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsBatch {
    /// Bytes received from public peers
    pub bytes_in: u64,
    /// Bytes written back to public peers
    pub bytes_out: u64,
    pub requests: u64,
    pub errors: u64,
    /// Summed request latency; divide by `requests` for the mean
    pub latency_ms: u64,
}

impl MetricsBatch {
    pub fn is_empty(&self) -> bool {
        self.bytes_in == 0
            && self.bytes_out == 0
            && self.requests == 0
            && self.errors == 0
            && self.latency_ms == 0
    }
}

/// Receives usage batches. Flush failures are the sink's problem; the
/// relay never blocks traffic on metrics delivery.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, session_id: &str, batch: MetricsBatch);
}

/// Default sink: emits batches as structured log events.
pub struct TracingSink;

#[async_trait]
impl MetricsSink for TracingSink {
    async fn record(&self, session_id: &str, batch: MetricsBatch) {
        info!(
            session_id,
            bytes_in = batch.bytes_in,
            bytes_out = batch.bytes_out,
            requests = batch.requests,
            errors = batch.errors,
            latency_ms = batch.latency_ms,
            "session usage"
        );
    }
}

/// Lock-free accumulation shared by every task of one session.
#[derive(Debug, Default)]
pub struct SessionCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
    latency_ms: AtomicU64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_latency_ms(&self, ms: u64) {
        self.latency_ms.fetch_add(ms, Ordering::Relaxed);
    }

    /// Take everything accumulated since the last drain, resetting to zero.
    pub fn drain(&self) -> MetricsBatch {
        MetricsBatch {
            bytes_in: self.bytes_in.swap(0, Ordering::Relaxed),
            bytes_out: self.bytes_out.swap(0, Ordering::Relaxed),
            requests: self.requests.swap(0, Ordering::Relaxed),
            errors: self.errors.swap(0, Ordering::Relaxed),
            latency_ms: self.latency_ms.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_drain_resets() {
        let counters = SessionCounters::new();
        counters.add_bytes_in(100);
        counters.add_bytes_out(250);
        counters.incr_requests();
        counters.incr_requests();
        counters.incr_errors();
        counters.add_latency_ms(42);

        let batch = counters.drain();
        assert_eq!(batch.bytes_in, 100);
        assert_eq!(batch.bytes_out, 250);
        assert_eq!(batch.requests, 2);
        assert_eq!(batch.errors, 1);
        assert_eq!(batch.latency_ms, 42);

        assert!(counters.drain().is_empty());
    }

    #[test]
    fn test_empty_batch() {
        assert!(MetricsBatch::default().is_empty());
        let batch = MetricsBatch {
            requests: 1,
            ..Default::default()
        };
        assert!(!batch.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_adds() {
        let counters = Arc::new(SessionCounters::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = counters.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    c.add_bytes_in(1);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counters.drain().bytes_in, 8000);
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_batch() {
        let sink = TracingSink;
        sink.record(
            "session-1",
            MetricsBatch {
                bytes_in: 10,
                ..Default::default()
            },
        )
        .await;
    }
}
