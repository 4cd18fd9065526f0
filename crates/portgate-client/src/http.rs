//! HTTP replay against the local service
//!
//! Relayed requests arrive as parsed parts; the replayer issues them
//! against the local server and hands back parts for the return trip.
//! Redirects are not followed, the public caller gets the 3xx as-is.

use crate::error::AgentError;
use portgate_proto::{body, BodyEncoding, ControlMessage};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("invalid method: {0}")]
    Method(String),

    #[error("local request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// A response from the local service, ready to ship back.
#[derive(Debug)]
pub struct ReplayedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl ReplayedResponse {
    /// Stand-in response when the local service cannot be reached.
    pub fn bad_gateway(reason: &str) -> Self {
        Self {
            status: 502,
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            content_type: Some("text/plain".to_string()),
            body: format!("Error: {}", reason).into_bytes(),
        }
    }

    /// Package the response as a control frame, encoding the body for
    /// transport based on its content type.
    pub fn into_message(self, request_id: u64) -> ControlMessage {
        let (encoding, payload) = if self.body.is_empty() {
            (BodyEncoding::Raw, None)
        } else {
            let (encoding, payload) =
                body::encode_for_transport(self.content_type.as_deref(), &self.body);
            (encoding, Some(payload))
        };
        ControlMessage::HttpResponse {
            request_id,
            status: self.status,
            headers: self.headers,
            encoding,
            body: payload,
        }
    }
}

pub struct HttpReplayer {
    client: reqwest::Client,
    base: String,
}

impl HttpReplayer {
    pub fn new(local_host: &str, local_port: u16, timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base: format!("http://{}:{}", local_host, local_port),
        })
    }

    /// Replay a relayed request. Never fails; local errors become a
    /// synthetic 502 so the public caller sees an answer instead of a hang.
    pub async fn replay(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        request_body: Option<Vec<u8>>,
    ) -> ReplayedResponse {
        match self.try_replay(method, path, headers, request_body).await {
            Ok(response) => response,
            Err(e) => {
                error!(method, path, error = %e, "local replay failed");
                ReplayedResponse::bad_gateway(&e.to_string())
            }
        }
    }

    async fn try_replay(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        request_body: Option<Vec<u8>>,
    ) -> Result<ReplayedResponse, ReplayError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ReplayError::Method(method.to_string()))?;
        let url = format!("{}{}", self.base, path);

        let mut request = self.client.request(method, &url);
        for (name, value) in headers {
            // Host must point at the local service; the framing headers
            // get recomputed for the rebuilt request.
            if name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
                || name.eq_ignore_ascii_case("connection")
            {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(bytes) = request_body {
            request = request.body(bytes);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();

        let mut response_headers = Vec::new();
        let mut content_type = None;
        for (name, value) in response.headers() {
            let name = name.as_str();
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
                || name.eq_ignore_ascii_case("connection")
            {
                continue;
            }
            let value = value.to_str().unwrap_or("").to_string();
            if name.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.clone());
            }
            response_headers.push((name.to_string(), value));
        }

        let body = response.bytes().await?.to_vec();
        debug!(status, bytes = body.len(), "local service answered");

        Ok(ReplayedResponse {
            status,
            headers: response_headers,
            content_type,
            body,
        })
    }
}
