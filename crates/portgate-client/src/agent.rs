//! Tunnel agent
//!
//! One [`Agent`] maintains one tunnel: it dials the relay, registers,
//! then serves relayed traffic against the local service until told to
//! stop. Lost relays are re-dialed with backoff; a rejected registration
//! ends the run, since retrying with the same credentials cannot succeed.

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::http::{HttpReplayer, ReplayedResponse};
use crate::metrics::{ReportSink, TracingReport, TrafficCounters};
use crate::reconnect::Backoff;
use crate::tcp::{open_local, LocalStreams};
use bytes::BytesMut;
use portgate_proto::{ControlMessage, FrameCodec};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How many unanswered pings count as a dead relay.
const MAX_MISSED_PONGS: u32 = 2;

pub struct Agent {
    config: AgentConfig,
    sink: Arc<dyn ReportSink>,
    shutdown: Arc<Notify>,
}

/// Asks a running agent to stop. Cloneable and safe to fire early.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Notify>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.notify_one();
    }
}

/// Why an established session ended.
enum SessionEnd {
    Shutdown,
    ChannelLost(String),
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            sink: Arc::new(TracingReport),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Keep the tunnel up until shut down.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut backoff = Backoff::new(self.config.reconnect.clone());
        loop {
            match self.connect_and_run().await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::ChannelLost(reason)) => {
                    warn!(%reason, "tunnel dropped, reconnecting");
                    // The session was up, so the schedule starts over.
                    backoff.reset();
                }
                Err(AgentError::Rejected(message)) => {
                    error!(%message, "relay rejected the registration");
                    return Err(AgentError::Rejected(message));
                }
                Err(e) => {
                    warn!(error = %e, attempt = backoff.attempt(), "connection attempt failed");
                }
            }

            tokio::select! {
                result = backoff.wait() => result?,
                _ = self.shutdown.notified() => return Ok(()),
            }
        }
    }

    /// One connection lifetime: dial, register, serve frames.
    async fn connect_and_run(&self) -> Result<SessionEnd, AgentError> {
        let stream = TcpStream::connect(&self.config.relay_addr).await?;
        debug!(relay = %self.config.relay_addr, "connected to relay");

        let (mut read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(write_half, out_rx));

        let register = ControlMessage::Register {
            protocol: self.config.protocol,
            local_host: self.config.local_host.clone(),
            local_port: self.config.local_port,
            preferred_port: self.config.preferred_port,
            auth_token: self.config.auth_token.clone(),
        };
        out_tx
            .send(register)
            .map_err(|_| AgentError::ChannelLost("writer gone".to_string()))?;

        let mut buf = BytesMut::with_capacity(8192);
        let reply = tokio::time::timeout(
            self.config.register_timeout,
            read_frame(&mut read_half, &mut buf),
        )
        .await;

        let (session_id, public_url) = match reply {
            Err(_) => {
                writer.abort();
                return Err(AgentError::ChannelLost(
                    "no reply to registration".to_string(),
                ));
            }
            Ok(Ok(None)) => {
                writer.abort();
                return Err(AgentError::ChannelLost(
                    "relay closed during registration".to_string(),
                ));
            }
            Ok(Err(e)) => {
                writer.abort();
                return Err(e);
            }
            Ok(Ok(Some(ControlMessage::Registered {
                session_id,
                public_url,
                ..
            }))) => (session_id, public_url),
            Ok(Ok(Some(ControlMessage::Error { message }))) => {
                writer.abort();
                return Err(AgentError::Rejected(message));
            }
            Ok(Ok(Some(other))) => {
                writer.abort();
                return Err(AgentError::ChannelLost(format!(
                    "unexpected {} during registration",
                    other.kind()
                )));
            }
        };

        info!("🌐 {} -> {}", public_url, self.config.local_target());
        debug!(session_id = %session_id, "session established");

        let session = ActiveSession {
            replayer: Arc::new(HttpReplayer::new(
                &self.config.local_host,
                self.config.local_port,
                self.config.request_timeout,
            )?),
            streams: Arc::new(LocalStreams::new()),
            counters: Arc::new(TrafficCounters::default()),
            tasks: SpawnedTasks::new(),
            out_tx: out_tx.clone(),
            local_target: self.config.local_target(),
        };

        let mut ping = tokio::time::interval(self.config.ping_interval);
        let mut reports = tokio::time::interval(self.config.metrics_interval);
        reports.tick().await;
        let mut missed_pongs: u32 = 0;

        let end = loop {
            tokio::select! {
                frame = read_frame(&mut read_half, &mut buf) => match frame {
                    Ok(Some(msg)) => {
                        if let Some(end) = session.handle(msg, &mut missed_pongs) {
                            break end;
                        }
                    }
                    Ok(None) => break SessionEnd::ChannelLost("relay closed the connection".to_string()),
                    Err(e) => break SessionEnd::ChannelLost(e.to_string()),
                },
                _ = ping.tick() => {
                    if missed_pongs >= MAX_MISSED_PONGS {
                        break SessionEnd::ChannelLost("keepalive timed out".to_string());
                    }
                    missed_pongs += 1;
                    if out_tx.send(ControlMessage::Ping { timestamp: now_ms() }).is_err() {
                        break SessionEnd::ChannelLost("writer gone".to_string());
                    }
                }
                _ = reports.tick() => {
                    let report = session.counters.drain();
                    if !report.is_empty() {
                        self.sink.record(report).await;
                    }
                }
                _ = self.shutdown.notified() => break SessionEnd::Shutdown,
            }
        };

        session.tasks.abort_all();
        session.streams.close_all();
        let report = session.counters.drain();
        if !report.is_empty() {
            self.sink.record(report).await;
        }

        drop(session);
        drop(out_tx);
        let _ = writer.await;

        Ok(end)
    }
}

/// Everything one established session needs to route frames.
struct ActiveSession {
    replayer: Arc<HttpReplayer>,
    streams: Arc<LocalStreams>,
    counters: Arc<TrafficCounters>,
    tasks: SpawnedTasks,
    out_tx: mpsc::UnboundedSender<ControlMessage>,
    local_target: String,
}

impl ActiveSession {
    /// Route one relay frame. Returns how the session ends, if it does.
    fn handle(&self, msg: ControlMessage, missed_pongs: &mut u32) -> Option<SessionEnd> {
        match msg {
            ControlMessage::HttpRequest {
                request_id,
                method,
                path,
                headers,
                encoding,
                body,
            } => {
                self.counters.incr_requests();
                let replayer = self.replayer.clone();
                let counters = self.counters.clone();
                let out_tx = self.out_tx.clone();
                self.tasks.push(tokio::spawn(async move {
                    let body = match body {
                        Some(payload) => match encoding.decode(&payload) {
                            Ok(bytes) => Some(bytes),
                            Err(e) => {
                                warn!(request_id, error = %e, "undecodable request body");
                                let _ = out_tx.send(
                                    ReplayedResponse::bad_gateway("bad request encoding")
                                        .into_message(request_id),
                                );
                                return;
                            }
                        },
                        None => None,
                    };
                    if let Some(bytes) = &body {
                        counters.add_bytes_in(bytes.len() as u64);
                    }
                    let response = replayer.replay(&method, &path, &headers, body).await;
                    counters.add_bytes_out(response.body.len() as u64);
                    let _ = out_tx.send(response.into_message(request_id));
                }));
                None
            }
            ControlMessage::TcpConnect { connection_id } => {
                self.tasks.push(tokio::spawn(open_local(
                    connection_id,
                    self.local_target.clone(),
                    self.streams.clone(),
                    self.out_tx.clone(),
                    self.counters.clone(),
                )));
                None
            }
            ControlMessage::TcpData {
                connection_id,
                bytes,
            } => {
                self.counters.add_bytes_in(bytes.len() as u64);
                if !self.streams.write(connection_id, bytes) {
                    debug!(connection_id, "data for unknown stream");
                }
                None
            }
            ControlMessage::TcpEnd { connection_id } => {
                self.streams.close(connection_id);
                None
            }
            ControlMessage::TcpError {
                connection_id,
                message,
            } => {
                debug!(connection_id, %message, "relay reported stream error");
                self.streams.close(connection_id);
                None
            }
            ControlMessage::Pong { timestamp } => {
                *missed_pongs = 0;
                debug!(rtt_ms = now_ms().saturating_sub(timestamp), "pong");
                None
            }
            ControlMessage::Ping { timestamp } => {
                let _ = self.out_tx.send(ControlMessage::Pong { timestamp });
                None
            }
            ControlMessage::Error { message } => {
                Some(SessionEnd::ChannelLost(format!("relay error: {}", message)))
            }
            other => {
                warn!(kind = other.kind(), "unexpected frame from relay");
                None
            }
        }
    }
}

/// Handles for in-flight replay and stream tasks.
struct SpawnedTasks(Mutex<Vec<JoinHandle<()>>>);

impl SpawnedTasks {
    fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    fn push(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.0.lock() {
            tasks.retain(|h| !h.is_finished());
            tasks.push(handle);
        }
    }

    fn abort_all(&self) {
        if let Ok(mut tasks) = self.0.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn read_frame(
    read_half: &mut OwnedReadHalf,
    buf: &mut BytesMut,
) -> Result<Option<ControlMessage>, AgentError> {
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
