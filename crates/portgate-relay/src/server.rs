//! Relay server
//!
//! Accepts agent control connections on the control port. A connection
//! must open with a registration frame; once the session is set up, the
//! reader loop routes every agent frame through the session's channel
//! until the agent goes away or the relay shuts down. The writer task
//! owns the socket's write half, so frames from many listener tasks are
//! serialized onto the wire in queue order.

use crate::admission::{Admission, AdmissionGate, AllowAll};
use crate::auth::{ResolvePrincipal, StaticTokenResolver};
use crate::channel::ControlChannel;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::metrics::{MetricsSink, TracingSink};
use crate::registry::{RegisterRequest, SessionRegistry};
use crate::store::{InMemorySessionStore, SessionStore};
use bytes::BytesMut;
use portgate_proto::{ControlMessage, FrameCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct RelayServer {
    config: RelayConfig,
    resolver: Arc<dyn ResolvePrincipal>,
    register_gate: Arc<dyn AdmissionGate>,
    public_gate: Arc<dyn AdmissionGate>,
    metrics: Arc<dyn MetricsSink>,
    store: Arc<dyn SessionStore>,
    shutdown: Arc<Notify>,
}

/// Asks a running server to stop. Cloneable and safe to fire early.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Notify>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.notify_one();
    }
}

impl RelayServer {
    /// A server with no resolver configured refuses every registration.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            resolver: Arc::new(StaticTokenResolver::new()),
            register_gate: Arc::new(AllowAll),
            public_gate: Arc::new(AllowAll),
            metrics: Arc::new(TracingSink),
            store: Arc::new(InMemorySessionStore::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ResolvePrincipal>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Gate applied to registration attempts, keyed by agent address.
    pub fn with_register_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.register_gate = gate;
        self
    }

    /// Gate applied to public connections on every tunnel port.
    pub fn with_public_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.public_gate = gate;
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

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Bind the control listener and serve until shut down.
    pub async fn run(self) -> Result<(), RelayError> {
        let addr = self.config.control_addr();
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "control listener started");
        self.serve(listener).await
    }

    /// Serve on an already-bound control listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), RelayError> {
        let registry = Arc::new(
            SessionRegistry::new(self.config.clone())
                .with_public_gate(self.public_gate.clone())
                .with_metrics(self.metrics.clone())
                .with_store(self.store.clone()),
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            debug!(%peer, "control connection accepted");
                            let registry = registry.clone();
                            let resolver = self.resolver.clone();
                            let register_gate = self.register_gate.clone();
                            let config = self.config.clone();
                            tokio::spawn(handle_control(
                                socket,
                                peer,
                                registry,
                                resolver,
                                register_gate,
                                config,
                            ));
                        }
                        Err(e) => {
                            error!(error = %e, "control accept failed");
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("relay shutting down");
                    registry.shutdown_all().await;
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_control(
    socket: TcpStream,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    resolver: Arc<dyn ResolvePrincipal>,
    register_gate: Arc<dyn AdmissionGate>,
    config: RelayConfig,
) {
    let (mut read_half, write_half) = socket.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(write_half, out_rx));
    let channel = ControlChannel::new(out_tx);

    let mut buf = BytesMut::with_capacity(8192);

    let first = match tokio::time::timeout(
        config.handshake_deadline,
        read_frame(&mut read_half, &mut buf),
    )
    .await
    {
        Ok(Ok(Some(msg))) => msg,
        Ok(Ok(None)) => {
            debug!(%peer, "control connection closed before registering");
            drop(channel);
            let _ = writer.await;
            return;
        }
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "unreadable frame during handshake");
            drop(channel);
            let _ = writer.await;
            return;
        }
        Err(_) => {
            debug!(%peer, "handshake timed out");
            drop(channel);
            let _ = writer.await;
            return;
        }
    };

    let (protocol, local_host, local_port, preferred_port, auth_token) = match first {
        ControlMessage::Register {
            protocol,
            local_host,
            local_port,
            preferred_port,
            auth_token,
        } => (protocol, local_host, local_port, preferred_port, auth_token),
        other => {
            warn!(%peer, kind = other.kind(), "first frame was not a registration");
            reject(channel, writer, "expected a registration".to_string()).await;
            return;
        }
    };

    if let Admission::Deny(reason) = register_gate.check(peer.ip()).await {
        warn!(%peer, %reason, "registration screened out");
        reject(channel, writer, format!("registration denied: {}", reason)).await;
        return;
    }

    let principal = match resolver.resolve(&auth_token).await {
        Ok(principal) => principal,
        Err(e) => {
            warn!(%peer, error = %e, "registration with bad token");
            reject(channel, writer, format!("unauthorized: {}", e)).await;
            return;
        }
    };

    let request = RegisterRequest {
        protocol,
        local_host,
        local_port,
        preferred_port,
    };
    let session = match registry.register(principal, request, channel.clone()).await {
        Ok(session) => session,
        Err(e) => {
            warn!(%peer, error = %e, "registration failed");
            reject(channel, writer, e.to_string()).await;
            return;
        }
    };

    let reply = ControlMessage::Registered {
        session_id: session.id.clone(),
        public_port: session.public_port,
        public_url: session.public_url(&config.public_host),
    };
    if channel.send(reply).is_err() {
        registry.deregister(&session.id).await;
        writer.abort();
        return;
    }

    loop {
        match read_frame(&mut read_half, &mut buf).await {
            Ok(Some(ControlMessage::Register { .. })) => {
                warn!(session_id = %session.id, "duplicate register on established channel");
                let _ = channel.send(ControlMessage::Error {
                    message: "already registered".to_string(),
                });
                break;
            }
            Ok(Some(msg)) => channel.dispatch(msg),
            Ok(None) => {
                debug!(session_id = %session.id, "agent disconnected");
                break;
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "control read failed");
                break;
            }
        }
    }

    registry.deregister(&session.id).await;
    writer.abort();
}

/// Send a final error frame, then let the writer drain and close.
async fn reject(channel: ControlChannel, writer: JoinHandle<()>, message: String) {
    let _ = channel.send(ControlMessage::Error { message });
    drop(channel);
    let _ = writer.await;
}

async fn read_frame(
    read_half: &mut OwnedReadHalf,
    buf: &mut BytesMut,
) -> Result<Option<ControlMessage>, RelayError> {
    use tokio::io::AsyncReadExt;

    loop {
        if let Some(msg) = FrameCodec::decode(buf)? {
            return Ok(Some(msg));
        }
        if read_half.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<ControlMessage>,
) {
    while let Some(msg) = out_rx.recv().await {
        let frame = match FrameCodec::encode(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, kind = msg.kind(), "failed to encode frame");
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&frame).await {
            debug!(error = %e, "control write failed");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
