//! Session registry
//!
//! Owns the port-to-session table. Registration reserves a port and the
//! table slot under one lock, then binds the public listener outside it;
//! a failed bind rolls the reservation back. Teardown is idempotent and
//! releases everything a session holds: its listener, its pumps, its
//! pending correlations, and finally its port.

use crate::admission::{AdmissionGate, AllowAll};
use crate::channel::ControlChannel;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::http::HttpRelay;
use crate::metrics::{MetricsSink, TracingSink};
use crate::ports::{PortAllocator, PortError};
use crate::session::{Session, SessionRecord};
use crate::store::{InMemorySessionStore, SessionStore};
use crate::tasks::SessionTasks;
use crate::tcp::TcpRelay;
use portgate_proto::{ControlMessage, Protocol};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;

/// Validated registration fields from the agent's first frame.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub protocol: Protocol,
    pub local_host: String,
    pub local_port: u16,
    pub preferred_port: Option<u16>,
}

struct SessionEntry {
    session: Arc<Session>,
    channel: ControlChannel,
    tasks: Arc<SessionTasks>,
}

#[derive(Default)]
struct RegistryInner {
    by_port: HashMap<u16, Arc<SessionEntry>>,
    by_id: HashMap<String, u16>,
}

pub struct SessionRegistry {
    config: RelayConfig,
    allocator: PortAllocator,
    inner: Mutex<RegistryInner>,
    gate: Arc<dyn AdmissionGate>,
    metrics: Arc<dyn MetricsSink>,
    store: Arc<dyn SessionStore>,
}

impl SessionRegistry {
    pub fn new(config: RelayConfig) -> Self {
        let allocator = PortAllocator::new(config.port_ranges.clone());
        Self {
            config,
            allocator,
            inner: Mutex::new(RegistryInner::default()),
            gate: Arc::new(AllowAll),
            metrics: Arc::new(TracingSink),
            store: Arc::new(InMemorySessionStore::new()),
        }
    }

    /// Gate applied to public connections on every session's port.
    pub fn with_public_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    /// Create a session for `principal`: allocate a port, bind its public
    /// listener, and start relaying on `channel`.
    pub async fn register(
        &self,
        principal: String,
        request: RegisterRequest,
        channel: ControlChannel,
    ) -> Result<Arc<Session>, RelayError> {
        if request.local_host.is_empty() {
            return Err(RelayError::InvalidRegistration(
                "local host is empty".to_string(),
            ));
        }
        if request.local_port == 0 {
            return Err(RelayError::InvalidRegistration(
                "local port is zero".to_string(),
            ));
        }

        let tasks = Arc::new(SessionTasks::new());

        // Reserve the port and the table slot atomically.
        let session = {
            let mut inner = self.inner.lock().await;
            let port = self
                .allocator
                .allocate(request.preferred_port, |p| inner.by_port.contains_key(&p))
                .map_err(|e| match e {
                    PortError::OutOfRange(p) => RelayError::InvalidRegistration(format!(
                        "preferred port {} is outside the allowed ranges",
                        p
                    )),
                    PortError::Exhausted => RelayError::NoPortAvailable,
                })?;

            let session = Arc::new(Session::new(
                principal,
                request.protocol,
                request.local_host.clone(),
                request.local_port,
                port,
            ));
            let entry = Arc::new(SessionEntry {
                session: session.clone(),
                channel: channel.clone(),
                tasks: tasks.clone(),
            });
            inner.by_port.insert(port, entry);
            inner.by_id.insert(session.id.clone(), port);
            session
        };

        // Bind outside the lock; a failure rolls the reservation back and
        // the agent is told. One attempt only, no silent re-allocation.
        let addr = SocketAddr::new(self.config.bind_addr, session.public_port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.by_port.remove(&session.public_port);
                inner.by_id.remove(&session.id);
                return Err(RelayError::BindFailed {
                    port: session.public_port,
                    reason: e.to_string(),
                });
            }
        };

        let listener_handle = match session.protocol {
            Protocol::Http => HttpRelay::spawn(
                listener,
                channel.clone(),
                self.gate.clone(),
                self.config.request_deadline,
            ),
            Protocol::Tcp => TcpRelay::spawn(
                listener,
                channel.clone(),
                self.gate.clone(),
                self.config.ready_deadline,
                tasks.clone(),
            ),
        };
        tasks.register("listener", listener_handle);

        let counters = channel.counters().clone();
        let sink = self.metrics.clone();
        let flush_id = session.id.clone();
        let interval = self.config.metrics_interval;
        tasks.register(
            "metrics",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let batch = counters.drain();
                    if !batch.is_empty() {
                        sink.record(&flush_id, batch).await;
                    }
                }
            }),
        );

        session.activate();
        self.store.persist(session.record()).await;
        info!(
            session_id = %session.id,
            principal = %session.principal,
            protocol = %session.protocol,
            public_port = session.public_port,
            local = %format!("{}:{}", session.local_host, session.local_port),
            "session registered"
        );
        Ok(session)
    }

    /// Tear a session down. Safe to call twice; the second call reports
    /// false and does nothing.
    pub async fn deregister(&self, session_id: &str) -> bool {
        let entry = {
            let mut inner = self.inner.lock().await;
            let Some(port) = inner.by_id.remove(session_id) else {
                return false;
            };
            let Some(entry) = inner.by_port.remove(&port) else {
                return false;
            };
            // The lock is held across the join so the port cannot be
            // re-allocated until the listener has actually stopped.
            entry.tasks.shutdown().await;
            entry
        };

        entry.channel.pending().fail_all();
        entry.channel.conns().close_all();

        let batch = entry.channel.counters().drain();
        if !batch.is_empty() {
            self.metrics.record(&entry.session.id, batch).await;
        }

        entry.session.close();
        self.store.persist(entry.session.record()).await;
        info!(
            session_id = %entry.session.id,
            public_port = entry.session.public_port,
            "session deregistered"
        );
        true
    }

    /// Shut every session down, telling each agent why.
    pub async fn shutdown_all(&self) {
        let entries: Vec<(String, ControlChannel)> = {
            let inner = self.inner.lock().await;
            inner
                .by_port
                .values()
                .map(|e| (e.session.id.clone(), e.channel.clone()))
                .collect()
        };

        for (_, channel) in &entries {
            let _ = channel.send(ControlMessage::Error {
                message: "relay shutting down".to_string(),
            });
        }

        let teardowns: Vec<_> = entries
            .iter()
            .map(|(session_id, _)| self.deregister(session_id))
            .collect();
        futures::future::join_all(teardowns).await;
    }

    pub async fn lookup(&self, port: u16) -> Option<Arc<Session>> {
        let inner = self.inner.lock().await;
        inner.by_port.get(&port).map(|e| e.session.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.by_port.len()
    }

    pub async fn active_sessions(&self) -> Vec<SessionRecord> {
        let inner = self.inner.lock().await;
        inner.by_port.values().map(|e| e.session.record()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsBatch;
    use crate::session::SessionStatus;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    fn config(ranges: Vec<std::ops::RangeInclusive<u16>>) -> RelayConfig {
        RelayConfig {
            bind_addr: "127.0.0.1".parse().unwrap(),
            port_ranges: ranges,
            ..RelayConfig::default()
        }
    }

    fn request(preferred: Option<u16>) -> RegisterRequest {
        RegisterRequest {
            protocol: Protocol::Http,
            local_host: "localhost".to_string(),
            local_port: 3000,
            preferred_port: preferred,
        }
    }

    fn channel() -> (ControlChannel, mpsc::UnboundedReceiver<ControlMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ControlChannel::new(tx), rx)
    }

    #[tokio::test]
    async fn test_register_allocates_in_range() {
        let registry = SessionRegistry::new(config(vec![45100..=45109]));
        let (ch, _rx) = channel();

        let session = registry
            .register("alice".to_string(), request(None), ch)
            .await
            .unwrap();
        assert!((45100..=45109).contains(&session.public_port));
        assert_eq!(session.status(), SessionStatus::Active);

        let found = registry.lookup(session.public_port).await.unwrap();
        assert_eq!(found.id, session.id);
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_register_honors_preferred_port() {
        let registry = SessionRegistry::new(config(vec![45110..=45119]));
        let (ch, _rx) = channel();

        let session = registry
            .register("alice".to_string(), request(Some(45115)), ch)
            .await
            .unwrap();
        assert_eq!(session.public_port, 45115);
    }

    #[tokio::test]
    async fn test_register_rejects_out_of_range_preferred() {
        let registry = SessionRegistry::new(config(vec![45120..=45129]));
        let (ch, _rx) = channel();

        let err = registry
            .register("alice".to_string(), request(Some(8080)), ch)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidRegistration(_)));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_register_exhaustion() {
        let registry = SessionRegistry::new(config(vec![45130..=45130]));
        let (ch1, _rx1) = channel();
        let (ch2, _rx2) = channel();

        registry
            .register("alice".to_string(), request(None), ch1)
            .await
            .unwrap();
        let err = registry
            .register("bob".to_string(), request(None), ch2)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoPortAvailable));
    }

    #[tokio::test]
    async fn test_register_validates_local_target() {
        let registry = SessionRegistry::new(config(vec![45140..=45149]));
        let (ch, _rx) = channel();

        let mut bad = request(None);
        bad.local_port = 0;
        let err = registry
            .register("alice".to_string(), bad, ch)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidRegistration(_)));
    }

    #[tokio::test]
    async fn test_bind_failure_rolls_back_reservation() {
        // Squat on the only port so the registry's bind fails.
        let squatter = TcpListener::bind("127.0.0.1:45150").await.unwrap();

        let registry = SessionRegistry::new(config(vec![45150..=45150]));
        let (ch, _rx) = channel();

        let err = registry
            .register("alice".to_string(), request(None), ch)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::BindFailed { port: 45150, .. }));
        assert_eq!(registry.session_count().await, 0);

        // The reservation was rolled back: freeing the port makes the
        // next registration succeed.
        drop(squatter);
        let (ch2, _rx2) = channel();
        let session = registry
            .register("alice".to_string(), request(None), ch2)
            .await
            .unwrap();
        assert_eq!(session.public_port, 45150);
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent_and_frees_port() {
        let registry = SessionRegistry::new(config(vec![45160..=45160]));
        let (ch, _rx) = channel();

        let session = registry
            .register("alice".to_string(), request(None), ch)
            .await
            .unwrap();

        assert!(registry.deregister(&session.id).await);
        assert!(!registry.deregister(&session.id).await);
        assert_eq!(registry.session_count().await, 0);

        // The port is claimable the moment deregister returns.
        let (ch2, _rx2) = channel();
        let reclaimed = registry
            .register("bob".to_string(), request(Some(45160)), ch2)
            .await
            .unwrap();
        assert_eq!(reclaimed.public_port, 45160);
    }

    #[tokio::test]
    async fn test_reclaim_never_races_listener_shutdown() {
        // One port, re-registered immediately after every teardown. If
        // the port were released before the listener stopped, one of
        // these binds would fail.
        let registry = SessionRegistry::new(config(vec![45230..=45230]));
        for i in 0..20 {
            let (ch, _rx) = channel();
            let session = registry
                .register(format!("user-{i}"), request(None), ch)
                .await
                .unwrap();
            assert_eq!(session.public_port, 45230);
            assert!(registry.deregister(&session.id).await);
        }
    }

    #[tokio::test]
    async fn test_deregister_fails_outstanding_requests() {
        let registry = SessionRegistry::new(config(vec![45170..=45179]));
        let (ch, _rx) = channel();

        let session = registry
            .register("alice".to_string(), request(None), ch.clone())
            .await
            .unwrap();

        let waiter = ch.pending().register(ch.next_id());
        registry.deregister(&session.id).await;

        assert!(waiter.await.is_err());
        assert_eq!(ch.conns().count(), 0);
    }

    struct CollectingSink {
        batches: std::sync::Mutex<Vec<(String, MetricsBatch)>>,
    }

    #[async_trait]
    impl MetricsSink for CollectingSink {
        async fn record(&self, session_id: &str, batch: MetricsBatch) {
            if let Ok(mut batches) = self.batches.lock() {
                batches.push((session_id.to_string(), batch));
            }
        }
    }

    #[tokio::test]
    async fn test_deregister_flushes_final_metrics() {
        let sink = Arc::new(CollectingSink {
            batches: std::sync::Mutex::new(Vec::new()),
        });
        let registry =
            SessionRegistry::new(config(vec![45180..=45189])).with_metrics(sink.clone());
        let (ch, _rx) = channel();

        let session = registry
            .register("alice".to_string(), request(None), ch.clone())
            .await
            .unwrap();

        ch.counters().add_bytes_in(512);
        ch.counters().incr_requests();
        registry.deregister(&session.id).await;

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, session.id);
        assert_eq!(batches[0].1.bytes_in, 512);
        assert_eq!(batches[0].1.requests, 1);
    }

    #[tokio::test]
    async fn test_store_sees_lifecycle() {
        let store = Arc::new(InMemorySessionStore::new());
        let registry = SessionRegistry::new(config(vec![45190..=45199])).with_store(store.clone());
        let (ch, _rx) = channel();

        let session = registry
            .register("alice".to_string(), request(None), ch)
            .await
            .unwrap();
        assert_eq!(store.load_active().await.len(), 1);

        registry.deregister(&session.id).await;
        assert!(store.load_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_all_notifies_agents() {
        let registry = SessionRegistry::new(config(vec![45200..=45209]));
        let (ch1, mut rx1) = channel();
        let (ch2, mut rx2) = channel();

        registry
            .register("alice".to_string(), request(None), ch1)
            .await
            .unwrap();
        registry
            .register("bob".to_string(), request(None), ch2)
            .await
            .unwrap();

        registry.shutdown_all().await;
        assert_eq!(registry.session_count().await, 0);

        assert!(matches!(
            rx1.recv().await.unwrap(),
            ControlMessage::Error { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            ControlMessage::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_registrations_get_unique_ports() {
        let registry = Arc::new(SessionRegistry::new(config(vec![45210..=45229])));
        let mut handles = Vec::new();

        for i in 0..10 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let (ch, _rx) = channel();
                registry
                    .register(format!("user-{i}"), request(None), ch)
                    .await
                    .map(|s| s.public_port)
            }));
        }

        let mut ports = std::collections::HashSet::new();
        for handle in handles {
            let port = handle.await.unwrap().unwrap();
            assert!(ports.insert(port), "port {port} assigned twice");
        }
    }
}
