//! HTTP body transport encoding
//!
//! Bodies relayed through the control channel are tagged with how they were
//! encoded so binary payloads survive the trip intact. The rule table:
//!
//! | content-type                      | encoding |
//! |-----------------------------------|----------|
//! | contains `text/`                  | Raw      |
//! | contains `application/json`       | Raw      |
//! | anything else, or no content-type | Base64   |
//!
//! Matching is case-insensitive on the whole header value, so
//! `Text/HTML; charset=utf-8` counts as textual.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Body decode errors
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// How a body is carried over the control channel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BodyEncoding {
    /// Bytes are the body verbatim
    Raw,
    /// Bytes are the base64 text of the body
    Base64,
}

impl BodyEncoding {
    /// Pick the transport encoding for a body with the given content-type
    pub fn for_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) => {
                let ct = ct.to_ascii_lowercase();
                if ct.contains("text/") || ct.contains("application/json") {
                    BodyEncoding::Raw
                } else {
                    BodyEncoding::Base64
                }
            }
            None => BodyEncoding::Base64,
        }
    }

    /// Encode a body for transport
    pub fn encode(self, body: &[u8]) -> Vec<u8> {
        match self {
            BodyEncoding::Raw => body.to_vec(),
            BodyEncoding::Base64 => BASE64.encode(body).into_bytes(),
        }
    }

    /// Decode a transported payload back into the original body
    pub fn decode(self, payload: &[u8]) -> Result<Vec<u8>, BodyError> {
        match self {
            BodyEncoding::Raw => Ok(payload.to_vec()),
            BodyEncoding::Base64 => Ok(BASE64.decode(payload)?),
        }
    }
}

/// Encode a body using the policy for its content-type
///
/// Returns the chosen encoding alongside the payload so the receiver can
/// reverse it.
pub fn encode_for_transport(content_type: Option<&str>, body: &[u8]) -> (BodyEncoding, Vec<u8>) {
    let encoding = BodyEncoding::for_content_type(content_type);
    (encoding, encoding.encode(body))
}

/// Find a header value by case-insensitive name
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
