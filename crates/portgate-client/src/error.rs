//! Agent error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The relay refused the registration. Retrying will not help.
    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("control channel lost: {0}")]
    ChannelLost(String),

    #[error("gave up after {0} connection attempts")]
    AttemptsExhausted(usize),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(#[from] portgate_proto::CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
