//! Portgate wire protocol
//!
//! This crate defines the control channel message types, the length-prefixed
//! frame codec, and the body transport encoding shared by the relay server
//! and the client agent.

pub mod body;
pub mod codec;
pub mod messages;

pub use body::{BodyEncoding, BodyError};
pub use codec::{CodecError, FrameCodec};
pub use messages::*;
