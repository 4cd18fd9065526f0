//! Public TCP listener and per-connection relay state
//!
//! Each accepted public connection is announced to the agent and must be
//! acknowledged before any bytes flow. The relay holds writes until the
//! ack arrives so data can never reach a connection the agent has not set
//! up yet. Per-connection ordering is preserved by giving every
//! connection its own writer queue.

use crate::admission::{Admission, AdmissionGate};
use crate::channel::ControlChannel;
use crate::metrics::SessionCounters;
use crate::tasks::SessionTasks;
use dashmap::DashMap;
use portgate_proto::ControlMessage;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const READ_CHUNK: usize = 16384;

/// Lifecycle of one relayed TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Announced to the agent, awaiting its ack
    Connecting,
    /// Acked; bytes may flow
    Ready,
    /// At least one chunk has moved
    Streaming,
    Closed,
}

struct RelayConn {
    state: Mutex<ConnState>,
    data_tx: mpsc::UnboundedSender<Vec<u8>>,
    ready_tx: Mutex<Option<oneshot::Sender<()>>>,
    closed: Arc<Notify>,
}

/// Table of live public TCP connections for one session.
#[derive(Clone, Default)]
pub struct RelayConns {
    conns: Arc<DashMap<u64, Arc<RelayConn>>>,
}

impl RelayConns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the close signal the public-side reader must watch so a
    /// termination from the agent stops both directions.
    pub(crate) fn insert(
        &self,
        connection_id: u64,
        data_tx: mpsc::UnboundedSender<Vec<u8>>,
        ready_tx: oneshot::Sender<()>,
    ) -> Arc<Notify> {
        let closed = Arc::new(Notify::new());
        self.conns.insert(
            connection_id,
            Arc::new(RelayConn {
                state: Mutex::new(ConnState::Connecting),
                data_tx,
                ready_tx: Mutex::new(Some(ready_tx)),
                closed: closed.clone(),
            }),
        );
        closed
    }

    /// Agent acknowledged the connection. Only valid while connecting.
    pub fn mark_ready(&self, connection_id: u64) -> bool {
        let Some(conn) = self.conns.get(&connection_id) else {
            warn!(connection_id, "ready ack for unknown connection");
            return false;
        };
        let Ok(mut state) = conn.state.lock() else {
            return false;
        };
        if *state != ConnState::Connecting {
            warn!(connection_id, ?state, "duplicate ready ack");
            return false;
        }
        *state = ConnState::Ready;
        if let Ok(mut ready) = conn.ready_tx.lock() {
            if let Some(tx) = ready.take() {
                let _ = tx.send(());
            }
        }
        true
    }

    /// Queue agent bytes for the public writer. Rejected until the
    /// connection is ready.
    pub fn write(&self, connection_id: u64, bytes: Vec<u8>) -> bool {
        let Some(conn) = self.conns.get(&connection_id) else {
            debug!(connection_id, "data for unknown connection");
            return false;
        };
        {
            let Ok(mut state) = conn.state.lock() else {
                return false;
            };
            match *state {
                ConnState::Connecting => {
                    warn!(connection_id, "data before ready ack, dropping");
                    return false;
                }
                ConnState::Ready => *state = ConnState::Streaming,
                ConnState::Streaming => {}
                ConnState::Closed => return false,
            }
        }
        conn.data_tx.send(bytes).is_ok()
    }

    /// Drop a connection. Idempotent; closing an unknown id is a no-op.
    pub fn close(&self, connection_id: u64) -> bool {
        match self.conns.remove(&connection_id) {
            Some((_, conn)) => {
                if let Ok(mut state) = conn.state.lock() {
                    *state = ConnState::Closed;
                }
                conn.closed.notify_one();
                debug!(connection_id, "closed relayed connection");
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let ids: Vec<u64> = self.conns.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.close(id);
        }
    }

    pub fn state(&self, connection_id: u64) -> Option<ConnState> {
        self.conns
            .get(&connection_id)
            .and_then(|c| c.state.lock().ok().map(|s| *s))
    }

    pub fn count(&self) -> usize {
        self.conns.len()
    }
}

/// Accept loop for a session's public TCP port.
pub struct TcpRelay;

impl TcpRelay {
    pub fn spawn(
        listener: TcpListener,
        channel: ControlChannel,
        gate: Arc<dyn AdmissionGate>,
        ready_deadline: Duration,
        tasks: Arc<SessionTasks>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        let connection_id = channel.next_id();
                        let handle = tokio::spawn(Self::handle_conn(
                            socket,
                            peer,
                            connection_id,
                            channel.clone(),
                            gate.clone(),
                            ready_deadline,
                            tasks.clone(),
                        ));
                        tasks.register(format!("conn-{connection_id}"), handle);
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed on public TCP listener");
                    }
                }
            }
        })
    }

    async fn handle_conn(
        socket: TcpStream,
        peer: SocketAddr,
        connection_id: u64,
        channel: ControlChannel,
        gate: Arc<dyn AdmissionGate>,
        ready_deadline: Duration,
        tasks: Arc<SessionTasks>,
    ) {
        if let Admission::Deny(reason) = gate.check(peer.ip()).await {
            debug!(%peer, %reason, "refused public TCP connection");
            return;
        }

        let (mut read_half, write_half) = socket.into_split();

        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let closed = channel.conns().insert(connection_id, data_tx, ready_tx);

        let write_key = format!("conn-{connection_id}-write");
        tasks.register(
            write_key.clone(),
            tokio::spawn(Self::write_pump(
                write_half,
                data_rx,
                channel.counters().clone(),
                tasks.clone(),
                write_key,
            )),
        );

        // Runs on every exit path: drops the table entry, which also ends
        // the write pump, and forgets this task.
        let _cleanup = scopeguard::guard(
            (channel.clone(), tasks.clone()),
            move |(channel, tasks)| {
                channel.conns().close(connection_id);
                tasks.remove(&format!("conn-{connection_id}"));
            },
        );

        if channel
            .send(ControlMessage::TcpConnect { connection_id })
            .is_err()
        {
            return;
        }
        debug!(connection_id, %peer, "public TCP connection accepted");

        match tokio::time::timeout(ready_deadline, ready_rx).await {
            Ok(Ok(())) => {}
            _ => {
                warn!(connection_id, "agent never acknowledged TCP connection");
                let _ = channel.send(ControlMessage::TcpEnd { connection_id });
                return;
            }
        }

        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            // A termination from the agent must stop the public-side
            // reader too; the closure arm wins over pending bytes.
            tokio::select! {
                biased;
                _ = closed.notified() => break,
                result = read_half.read(&mut buf) => match result {
                    Ok(0) => {
                        let _ = channel.send(ControlMessage::TcpEnd { connection_id });
                        break;
                    }
                    Ok(n) => {
                        channel.counters().add_bytes_in(n as u64);
                        if channel
                            .send(ControlMessage::TcpData {
                                connection_id,
                                bytes: buf[..n].to_vec(),
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = channel.send(ControlMessage::TcpError {
                            connection_id,
                            message: e.to_string(),
                        });
                        break;
                    }
                },
            }
        }
    }

    async fn write_pump(
        mut write_half: OwnedWriteHalf,
        mut data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        counters: Arc<SessionCounters>,
        tasks: Arc<SessionTasks>,
        key: String,
    ) {
        while let Some(bytes) = data_rx.recv().await {
            if let Err(e) = write_half.write_all(&bytes).await {
                debug!(error = %e, "public TCP write failed");
                break;
            }
            counters.add_bytes_out(bytes.len() as u64);
        }
        let _ = write_half.shutdown().await;
        tasks.remove(&key);
    }
}
