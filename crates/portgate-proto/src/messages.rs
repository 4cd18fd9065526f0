//! Control channel message types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::body::BodyEncoding;

/// Main control channel message enum
///
/// Every frame on a control connection carries exactly one of these. The
/// first frame a client sends must be `Register`; the relay answers with
/// `Registered` on success or `Error` followed by a close. After that,
/// traffic messages are keyed by `request_id` (HTTP) or `connection_id`
/// (TCP); both are unique for the lifetime of the channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    // Keepalive
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },

    // Registration handshake
    Register {
        protocol: Protocol,
        local_host: String,
        local_port: u16,
        preferred_port: Option<u16>,
        auth_token: String,
    },
    Registered {
        session_id: String,
        public_port: u16,
        public_url: String,
    },
    Error {
        message: String,
    },

    // HTTP relay (request/response correlation)
    HttpRequest {
        request_id: u64,
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        encoding: BodyEncoding,
        #[serde(with = "serde_bytes_option")]
        body: Option<Vec<u8>>,
    },
    HttpResponse {
        request_id: u64,
        status: u16,
        headers: Vec<(String, String)>,
        encoding: BodyEncoding,
        #[serde(with = "serde_bytes_option")]
        body: Option<Vec<u8>>,
    },

    // TCP relay (per-connection byte streams)
    TcpConnect {
        connection_id: u64,
    },
    TcpReady {
        connection_id: u64,
    },
    TcpData {
        connection_id: u64,
        #[serde(with = "serde_bytes")]
        bytes: Vec<u8>,
    },
    TcpEnd {
        connection_id: u64,
    },
    TcpError {
        connection_id: u64,
        message: String,
    },
}

impl ControlMessage {
    /// Short name for logging without dumping payload bytes
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
            ControlMessage::Register { .. } => "register",
            ControlMessage::Registered { .. } => "registered",
            ControlMessage::Error { .. } => "error",
            ControlMessage::HttpRequest { .. } => "http_request",
            ControlMessage::HttpResponse { .. } => "http_response",
            ControlMessage::TcpConnect { .. } => "tcp_connect",
            ControlMessage::TcpReady { .. } => "tcp_ready",
            ControlMessage::TcpData { .. } => "tcp_data",
            ControlMessage::TcpEnd { .. } => "tcp_end",
            ControlMessage::TcpError { .. } => "tcp_error",
        }
    }
}

// Custom serde helpers so payload fields serialize as compact byte strings
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

mod serde_bytes_option {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_some(&bytes),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<Vec<u8>>::deserialize(deserializer)
    }
}

/// Tunnel protocol selector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
        }
    }

    /// URL scheme used when advertising the public endpoint
    pub fn scheme(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown protocol name
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown protocol '{0}', expected 'http' or 'tcp'")]
pub struct InvalidProtocol(pub String);

impl FromStr for Protocol {
    type Err = InvalidProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(InvalidProtocol(other.to_string())),
        }
    }
}
