//! Correlation table for in-flight HTTP requests
//!
//! Each relayed request gets a one-shot slot keyed by its request id. The
//! public-side handler parks on the receiver; the control-channel reader
//! completes the slot when the agent's response arrives. Slots for requests
//! that time out are cancelled, and a dying session fails every remaining
//! slot at once so parked handlers wake up and answer 502.

use dashmap::DashMap;
use portgate_proto::BodyEncoding;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Response fields carried from the control channel back to the waiting
/// public-side handler.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponseParts {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub encoding: BodyEncoding,
    pub body: Option<Vec<u8>>,
}

/// Tracks requests awaiting a response from the agent.
#[derive(Clone)]
pub struct PendingRequests {
    requests: Arc<DashMap<u64, oneshot::Sender<HttpResponseParts>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Register a request and get the receiver its response will arrive on.
    pub fn register(&self, request_id: u64) -> oneshot::Receiver<HttpResponseParts> {
        let (tx, rx) = oneshot::channel();
        self.requests.insert(request_id, tx);
        debug!(request_id, "registered pending request");
        rx
    }

    /// Complete a pending request with the agent's response.
    ///
    /// Returns false if no such request is pending (already timed out,
    /// cancelled, or answered).
    pub fn respond(&self, request_id: u64, parts: HttpResponseParts) -> bool {
        match self.requests.remove(&request_id) {
            Some((_, tx)) => {
                if tx.send(parts).is_err() {
                    warn!(request_id, "response receiver dropped before delivery");
                    return false;
                }
                debug!(request_id, "completed pending request");
                true
            }
            None => {
                warn!(request_id, "response for unknown request");
                false
            }
        }
    }

    /// Drop the slot for a request that will no longer be answered.
    pub fn cancel(&self, request_id: u64) {
        if self.requests.remove(&request_id).is_some() {
            debug!(request_id, "cancelled pending request");
        }
    }

    /// Fail every outstanding request at once.
    ///
    /// Dropping the senders wakes each parked receiver with a recv error,
    /// which the handlers translate into 502s. Used when the control
    /// channel goes away.
    pub fn fail_all(&self) {
        let count = self.requests.len();
        self.requests.clear();
        if count > 0 {
            debug!(count, "failed all pending requests");
        }
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
