//! Relay error types

use thiserror::Error;

/// Errors surfaced by the relay core.
///
/// Registration failures are reported back to the agent over the control
/// channel; per-request failures are translated into HTTP status codes on
/// the public side (see the listener modules).
#[derive(Debug, Error)]
pub enum RelayError {
    /// Token did not resolve to a principal
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Every port in every allowed range is assigned
    #[error("no public port available")]
    NoPortAvailable,

    /// Registration payload failed validation
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    /// A screening gate refused the peer
    #[error("admission denied: {0}")]
    AdmissionDenied(String),

    /// Public listener could not be bound to the allocated port
    #[error("failed to bind public port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    /// Agent never produced a response for a correlated request
    #[error("no response from agent before the deadline")]
    CorrelationTimeout,

    /// Agent is no longer reachable over the control connection
    #[error("control channel lost")]
    ChannelLost,

    /// Local service behind the agent could not be reached
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Codec(#[from] portgate_proto::CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
