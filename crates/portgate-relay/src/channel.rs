//! Shared control-channel handle
//!
//! One per agent connection. Listener tasks use it to queue frames for
//! the agent and to draw correlation ids; the reader loop uses it to
//! route the agent's frames back to whichever handler is waiting. All
//! clones share the same queues and tables.

use crate::error::RelayError;
use crate::metrics::SessionCounters;
use crate::pending::{HttpResponseParts, PendingRequests};
use crate::tcp::RelayConns;
use portgate_proto::ControlMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ControlChannel {
    outbound: mpsc::UnboundedSender<ControlMessage>,
    pending: PendingRequests,
    conns: RelayConns,
    counters: Arc<SessionCounters>,
    next_id: Arc<AtomicU64>,
}

impl ControlChannel {
    pub fn new(outbound: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self {
            outbound,
            pending: PendingRequests::new(),
            conns: RelayConns::new(),
            counters: Arc::new(SessionCounters::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Queue a frame for the agent.
    pub fn send(&self, msg: ControlMessage) -> Result<(), RelayError> {
        self.outbound
            .send(msg)
            .map_err(|_| RelayError::ChannelLost)
    }

    /// Draw the next correlation id. Request and connection ids share one
    /// sequence, so an id never means two things at once.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn conns(&self) -> &RelayConns {
        &self.conns
    }

    pub fn counters(&self) -> &Arc<SessionCounters> {
        &self.counters
    }

    /// Route one frame from the agent to its waiting handler.
    ///
    /// Stale frames (responses for timed-out requests, data for closed
    /// connections) are logged and dropped by the tables themselves.
    pub fn dispatch(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::HttpResponse {
                request_id,
                status,
                headers,
                encoding,
                body,
            } => {
                self.pending.respond(
                    request_id,
                    HttpResponseParts {
                        status,
                        headers,
                        encoding,
                        body,
                    },
                );
            }
            ControlMessage::TcpReady { connection_id } => {
                self.conns.mark_ready(connection_id);
            }
            ControlMessage::TcpData {
                connection_id,
                bytes,
            } => {
                self.conns.write(connection_id, bytes);
            }
            ControlMessage::TcpEnd { connection_id } => {
                self.conns.close(connection_id);
            }
            ControlMessage::TcpError {
                connection_id,
                message,
            } => {
                debug!(connection_id, %message, "agent reported connection error");
                self.counters.incr_errors();
                self.conns.close(connection_id);
            }
            ControlMessage::Ping { timestamp } => {
                let _ = self.send(ControlMessage::Pong { timestamp });
            }
            ControlMessage::Error { message } => {
                warn!(%message, "agent reported error");
            }
            other => {
                warn!(kind = other.kind(), "unexpected frame from agent");
            }
        }
    }
}
