//! Relay side of the tunnel
//!
//! The relay accepts control connections from agents, allocates a public
//! port per session, and forwards traffic arriving on that port over the
//! agent's control channel. HTTP sessions get request/response relaying
//! with correlation ids; TCP sessions get raw byte streams keyed by
//! connection id.
//!
//! [`RelayServer`] is the entry point. Everything else hangs off the
//! session registry it builds internally.

pub mod admission;
pub mod auth;
pub mod channel;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod pending;
pub mod ports;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod tasks;
pub mod tcp;

pub use admission::{
    Admission, AdmissionChain, AdmissionGate, AllowAll, CidrBlocklistGate, CidrError, DenyReason,
    SlidingWindowGate,
};
pub use auth::{AuthError, JwtResolver, ResolvePrincipal, StaticTokenResolver};
pub use config::{default_port_ranges, RelayConfig};
pub use error::RelayError;
pub use metrics::{MetricsBatch, MetricsSink, TracingSink};
pub use registry::{RegisterRequest, SessionRegistry};
pub use server::{RelayServer, ShutdownHandle};
pub use session::{Session, SessionRecord, SessionStatus};
pub use store::{InMemorySessionStore, SessionStore};
