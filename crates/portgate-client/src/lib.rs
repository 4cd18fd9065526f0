//! Client side of the tunnel
//!
//! The agent dials out to a relay, registers a tunnel for a local
//! service, and replays whatever the relay forwards: HTTP requests are
//! re-issued against the local server, TCP streams are piped byte for
//! byte. NAT and firewalls are a non-issue because the agent only ever
//! makes outbound connections.

pub mod agent;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod reconnect;
mod tcp;

pub use agent::{Agent, ShutdownHandle};
pub use config::{AgentConfig, AgentConfigBuilder};
pub use error::AgentError;
pub use http::{HttpReplayer, ReplayedResponse};
pub use metrics::{ReportSink, TracingReport, TrafficReport};
pub use reconnect::{Backoff, ReconnectConfig};
