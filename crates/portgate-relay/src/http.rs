//! Public HTTP listener
//!
//! Accepts one request per public connection, forwards it over the
//! control channel, and writes back whatever the agent answers. Each
//! handler parks on its own correlation slot, so a slow request never
//! holds up other requests on the same session. Failure mapping on the
//! public side: agent silent past the deadline is 504, channel gone is
//! 502, screening rejects are 429 or 403.

use crate::admission::{Admission, AdmissionGate, DenyReason};
use crate::channel::ControlChannel;
use crate::error::RelayError;
use bytes::BytesMut;
use portgate_proto::{body, BodyEncoding, ControlMessage, FrameCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error};

const MAX_HEADERS: usize = 64;
const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Bodies must leave frame room for the head and envelope.
pub const MAX_BODY_BYTES: usize = FrameCodec::MAX_FRAME_SIZE - MAX_HEAD_BYTES;

#[derive(Debug, Error)]
enum ReadError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request body exceeds {MAX_BODY_BYTES} bytes")]
    TooLarge,

    #[error("request has no length; chunked bodies are not relayed")]
    LengthRequired,

    /// Peer hung up before finishing the request
    #[error("connection closed mid-request")]
    Eof,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct ParsedRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// Accept loop for a session's public HTTP port.
pub struct HttpRelay;

impl HttpRelay {
    pub fn spawn(
        listener: TcpListener,
        channel: ControlChannel,
        gate: Arc<dyn AdmissionGate>,
        deadline: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut socket, peer)) => {
                        let channel = channel.clone();
                        let gate = gate.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                Self::relay_request(&mut socket, peer, &channel, &gate, deadline)
                                    .await
                            {
                                debug!(%peer, error = %e, "public request failed");
                            }
                            let _ = socket.shutdown().await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed on public HTTP listener");
                    }
                }
            }
        })
    }

    /// Relay a single request and write the response.
    ///
    /// Domain failures become HTTP statuses on `socket`; only transport
    /// errors bubble up.
    async fn relay_request<S>(
        socket: &mut S,
        peer: SocketAddr,
        channel: &ControlChannel,
        gate: &Arc<dyn AdmissionGate>,
        deadline: Duration,
    ) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match gate.check(peer.ip()).await {
            Admission::Allow => {}
            Admission::Deny(DenyReason::RateLimited) => {
                debug!(%peer, "public request rate limited");
                Self::write_simple_response(socket, 429, "rate limit exceeded").await?;
                return Ok(());
            }
            Admission::Deny(DenyReason::Blocked(entry)) => {
                debug!(%peer, %entry, "public request blocked");
                Self::write_simple_response(socket, 403, "forbidden").await?;
                return Ok(());
            }
        }

        let request = match tokio::time::timeout(deadline, Self::read_request(socket)).await {
            Ok(Ok(request)) => request,
            Ok(Err(ReadError::Malformed(reason))) => {
                debug!(%peer, %reason, "rejecting malformed request");
                Self::write_simple_response(socket, 400, "malformed request").await?;
                return Ok(());
            }
            Ok(Err(ReadError::TooLarge)) => {
                Self::write_simple_response(socket, 413, "request body too large").await?;
                return Ok(());
            }
            Ok(Err(ReadError::LengthRequired)) => {
                Self::write_simple_response(socket, 411, "content-length required").await?;
                return Ok(());
            }
            Ok(Err(ReadError::Eof)) => return Ok(()),
            Ok(Err(ReadError::Io(e))) => return Err(e.into()),
            Err(_) => {
                debug!(%peer, "timed out reading request");
                return Ok(());
            }
        };

        let request_id = channel.next_id();
        let waiter = channel.pending().register(request_id);

        let content_type = body::header_value(&request.headers, "content-type");
        let (encoding, payload) = if request.body.is_empty() {
            (BodyEncoding::Raw, None)
        } else {
            let (encoding, payload) = body::encode_for_transport(content_type, &request.body);
            (encoding, Some(payload))
        };

        let counters = channel.counters();
        counters.incr_requests();
        counters.add_bytes_in(request.body.len() as u64);
        debug!(request_id, method = %request.method, path = %request.path, "relaying request");

        let message = ControlMessage::HttpRequest {
            request_id,
            method: request.method,
            path: request.path,
            headers: request.headers,
            encoding,
            body: payload,
        };
        if channel.send(message).is_err() {
            channel.pending().cancel(request_id);
            counters.incr_errors();
            Self::write_simple_response(socket, 502, "tunnel disconnected").await?;
            return Ok(());
        }

        let started = Instant::now();
        match tokio::time::timeout(deadline, waiter).await {
            Ok(Ok(parts)) => {
                counters.add_latency_ms(started.elapsed().as_millis() as u64);
                let response_body = match parts
                    .body
                    .as_deref()
                    .map(|b| parts.encoding.decode(b))
                    .transpose()
                {
                    Ok(decoded) => decoded.unwrap_or_default(),
                    Err(e) => {
                        debug!(request_id, error = %e, "agent response body undecodable");
                        counters.incr_errors();
                        Self::write_simple_response(socket, 502, "invalid response from tunnel")
                            .await?;
                        return Ok(());
                    }
                };
                counters.add_bytes_out(response_body.len() as u64);
                Self::write_response(socket, parts.status, &parts.headers, &response_body).await?;
            }
            Ok(Err(_)) => {
                // Sender dropped: the session died under us.
                counters.incr_errors();
                Self::write_simple_response(socket, 502, "tunnel disconnected").await?;
            }
            Err(_) => {
                channel.pending().cancel(request_id);
                counters.incr_errors();
                debug!(request_id, "request timed out waiting for agent");
                Self::write_simple_response(socket, 504, "tunnel timeout").await?;
            }
        }

        Ok(())
    }

    /// Read one request head plus its content-length body.
    async fn read_request<S>(socket: &mut S) -> Result<ParsedRequest, ReadError>
    where
        S: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(4096);

        let (method, path, headers, head_len) = loop {
            {
                let mut header_slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut req = httparse::Request::new(&mut header_slots);
                match req.parse(&buf) {
                    Ok(httparse::Status::Complete(head_len)) => {
                        let method = req.method.unwrap_or("GET").to_string();
                        let path = req.path.unwrap_or("/").to_string();
                        let headers: Vec<(String, String)> = req
                            .headers
                            .iter()
                            .map(|h| {
                                (
                                    h.name.to_string(),
                                    String::from_utf8_lossy(h.value).to_string(),
                                )
                            })
                            .collect();
                        break (method, path, headers, head_len);
                    }
                    Ok(httparse::Status::Partial) => {}
                    Err(e) => return Err(ReadError::Malformed(e.to_string())),
                }
            }

            if buf.len() > MAX_HEAD_BYTES {
                return Err(ReadError::Malformed("request head too large".to_string()));
            }
            if socket.read_buf(&mut buf).await? == 0 {
                return Err(ReadError::Eof);
            }
        };

        if body::header_value(&headers, "transfer-encoding").is_some() {
            return Err(ReadError::LengthRequired);
        }

        let content_length = body::header_value(&headers, "content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if content_length > MAX_BODY_BYTES {
            return Err(ReadError::TooLarge);
        }

        let mut body = buf[head_len..].to_vec();
        while body.len() < content_length {
            if socket.read_buf(&mut body).await? == 0 {
                return Err(ReadError::Eof);
            }
        }
        // A keep-alive peer may have pipelined further bytes; this
        // listener serves one request per connection.
        body.truncate(content_length);

        Ok(ParsedRequest {
            method,
            path,
            headers,
            body,
        })
    }

    /// Write the agent's response, recomputing framing headers.
    async fn write_response<S>(
        socket: &mut S,
        status: u16,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<(), std::io::Error>
    where
        S: AsyncWrite + Unpin,
    {
        let mut response = format!("HTTP/1.1 {} {}\r\n", status, status_text(status));
        for (name, value) in headers {
            let lower = name.to_ascii_lowercase();
            if lower == "content-length" || lower == "transfer-encoding" || lower == "connection" {
                continue;
            }
            response.push_str(&format!("{}: {}\r\n", name, value));
        }
        response.push_str(&format!("Content-Length: {}\r\n", body.len()));
        response.push_str("Connection: close\r\n\r\n");

        socket.write_all(response.as_bytes()).await?;
        socket.write_all(body).await?;
        socket.flush().await
    }

    async fn write_simple_response<S>(
        socket: &mut S,
        status: u16,
        message: &str,
    ) -> Result<(), std::io::Error>
    where
        S: AsyncWrite + Unpin,
    {
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            status_text(status),
            message.len(),
            message
        );
        socket.write_all(response.as_bytes()).await?;
        socket.flush().await
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
