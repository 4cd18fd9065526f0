//! Tunnel session model

use chrono::{DateTime, Utc};
use portgate_proto::Protocol;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Port reserved, public listener not yet accepting
    Pending,
    /// Public listener running
    Active,
    /// Torn down; the port has been returned to the pool
    Closed,
}

/// One registered tunnel: a public port bound on behalf of a principal,
/// relayed to a service behind the agent.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub principal: String,
    pub protocol: Protocol,
    pub local_host: String,
    pub local_port: u16,
    pub public_port: u16,
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    closed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        principal: String,
        protocol: Protocol,
        local_host: String,
        local_port: u16,
        public_port: u16,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            principal,
            protocol,
            local_host,
            local_port,
            public_port,
            created_at: Utc::now(),
            state: Mutex::new(SessionState {
                status: SessionStatus::Pending,
                closed_at: None,
            }),
        }
    }

    pub fn status(&self) -> SessionStatus {
        if let Ok(state) = self.state.lock() {
            state.status
        } else {
            SessionStatus::Closed
        }
    }

    /// Mark the session live once its public listener is accepting.
    pub fn activate(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.status == SessionStatus::Pending {
                state.status = SessionStatus::Active;
            }
        }
    }

    /// Mark the session closed. Returns false if it already was, so
    /// teardown stays idempotent.
    pub fn close(&self) -> bool {
        if let Ok(mut state) = self.state.lock() {
            if state.status == SessionStatus::Closed {
                return false;
            }
            state.status = SessionStatus::Closed;
            state.closed_at = Some(Utc::now());
            true
        } else {
            false
        }
    }

    /// Public URL advertised to the agent.
    pub fn public_url(&self, public_host: &str) -> String {
        format!(
            "{}://{}:{}",
            self.protocol.scheme(),
            public_host,
            self.public_port
        )
    }

    /// Snapshot for persistence and dashboards.
    pub fn record(&self) -> SessionRecord {
        let (status, closed_at) = match self.state.lock() {
            Ok(state) => (state.status, state.closed_at),
            Err(_) => (SessionStatus::Closed, None),
        };
        SessionRecord {
            id: self.id.clone(),
            principal: self.principal.clone(),
            protocol: self.protocol,
            local_host: self.local_host.clone(),
            local_port: self.local_port,
            public_port: self.public_port,
            status,
            created_at: self.created_at,
            closed_at,
        }
    }
}

/// Serializable view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub principal: String,
    pub protocol: Protocol,
    pub local_host: String,
    pub local_port: u16,
    pub public_port: u16,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "alice".to_string(),
            Protocol::Http,
            "localhost".to_string(),
            3000,
            24001,
        )
    }

    #[test]
    fn test_lifecycle() {
        let s = session();
        assert_eq!(s.status(), SessionStatus::Pending);

        s.activate();
        assert_eq!(s.status(), SessionStatus::Active);

        assert!(s.close());
        assert_eq!(s.status(), SessionStatus::Closed);
    }

    #[test]
    fn test_close_is_idempotent() {
        let s = session();
        assert!(s.close());
        assert!(!s.close());
    }

    #[test]
    fn test_activate_after_close_is_ignored() {
        let s = session();
        s.close();
        s.activate();
        assert_eq!(s.status(), SessionStatus::Closed);
    }

    #[test]
    fn test_public_url() {
        let s = session();
        assert_eq!(s.public_url("relay.example.com"), "http://relay.example.com:24001");

        let t = Session::new(
            "bob".to_string(),
            Protocol::Tcp,
            "localhost".to_string(),
            5432,
            31000,
        );
        assert_eq!(t.public_url("10.0.0.5"), "tcp://10.0.0.5:31000");
    }

    #[test]
    fn test_record_snapshot() {
        let s = session();
        s.activate();

        let record = s.record();
        assert_eq!(record.id, s.id);
        assert_eq!(record.principal, "alice");
        assert_eq!(record.public_port, 24001);
        assert_eq!(record.status, SessionStatus::Active);
        assert!(record.closed_at.is_none());

        s.close();
        assert!(s.record().closed_at.is_some());
    }

    #[test]
    fn test_record_serializes() {
        let record = session().record();
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"pending\""));
        let back: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
