//! Local TCP stream handling
//!
//! For each `TcpConnect` from the relay the agent dials the local
//! service, acks with `TcpReady`, and pumps bytes both ways. Stream
//! state is a sender table keyed by connection id; dropping the sender
//! ends the write pump, which closes the local socket.

use crate::metrics::TrafficCounters;
use dashmap::DashMap;
use portgate_proto::ControlMessage;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

const READ_CHUNK: usize = 16384;

struct LocalStream {
    data_tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<Notify>,
}

/// Live local connections for the current session.
#[derive(Default)]
pub(crate) struct LocalStreams {
    streams: DashMap<u64, LocalStream>,
}

impl LocalStreams {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn insert(&self, connection_id: u64, data_tx: mpsc::UnboundedSender<Vec<u8>>) -> Arc<Notify> {
        let closed = Arc::new(Notify::new());
        self.streams.insert(
            connection_id,
            LocalStream {
                data_tx,
                closed: closed.clone(),
            },
        );
        closed
    }

    /// Queue relay bytes for the local writer.
    pub(crate) fn write(&self, connection_id: u64, bytes: Vec<u8>) -> bool {
        match self.streams.get(&connection_id) {
            Some(stream) => stream.data_tx.send(bytes).is_ok(),
            None => false,
        }
    }

    /// Forget a stream. The writer drains whatever is queued, the
    /// reader stops at the close signal. Idempotent.
    pub(crate) fn close(&self, connection_id: u64) {
        if let Some((_, stream)) = self.streams.remove(&connection_id) {
            stream.closed.notify_one();
            debug!(connection_id, "closed local stream");
        }
    }

    pub(crate) fn close_all(&self) {
        let ids: Vec<u64> = self.streams.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.close(id);
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.streams.len()
    }
}

/// Dial the local service for one relayed connection and pump bytes
/// until either side is done.
pub(crate) async fn open_local(
    connection_id: u64,
    target: String,
    streams: Arc<LocalStreams>,
    out_tx: mpsc::UnboundedSender<ControlMessage>,
    counters: Arc<TrafficCounters>,
) {
    let stream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(connection_id, error = %e, "local connect failed");
            let _ = out_tx.send(ControlMessage::TcpError {
                connection_id,
                message: format!("connect {}: {}", target, e),
            });
            return;
        }
    };

    let (mut read_half, mut write_half) = stream.into_split();
    let (data_tx, mut data_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let closed = streams.insert(connection_id, data_tx);
    counters.incr_connections();

    if out_tx
        .send(ControlMessage::TcpReady { connection_id })
        .is_err()
    {
        streams.close(connection_id);
        return;
    }
    debug!(connection_id, target = %target, "local connection ready");

    // Relay bytes into the local socket.
    let write_pump = tokio::spawn(async move {
        while let Some(bytes) = data_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Local socket back to the relay. A termination from the relay must
    // stop this direction too, not just the writer.
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            biased;
            _ = closed.notified() => break,
            result = read_half.read(&mut buf) => match result {
                Ok(0) => {
                    let _ = out_tx.send(ControlMessage::TcpEnd { connection_id });
                    break;
                }
                Ok(n) => {
                    counters.add_bytes_out(n as u64);
                    if out_tx
                        .send(ControlMessage::TcpData {
                            connection_id,
                            bytes: buf[..n].to_vec(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    let _ = out_tx.send(ControlMessage::TcpError {
                        connection_id,
                        message: e.to_string(),
                    });
                    break;
                }
            },
        }
    }

    streams.close(connection_id);
    let _ = write_pump.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr.to_string()
    }

    async fn expect_frame(out_rx: &mut UnboundedReceiver<ControlMessage>) -> ControlMessage {
        tokio::time::timeout(std::time::Duration::from_secs(2), out_rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_open_local_echo_round_trip() {
        let target = echo_server().await;
        let streams = Arc::new(LocalStreams::new());
        let counters = Arc::new(TrafficCounters::default());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(open_local(
            7,
            target,
            streams.clone(),
            out_tx,
            counters.clone(),
        ));

        match expect_frame(&mut out_rx).await {
            ControlMessage::TcpReady { connection_id } => assert_eq!(connection_id, 7),
            other => panic!("expected TcpReady, got {}", other.kind()),
        }
        assert_eq!(streams.count(), 1);

        assert!(streams.write(7, b"over the tunnel".to_vec()));
        match expect_frame(&mut out_rx).await {
            ControlMessage::TcpData {
                connection_id,
                bytes,
            } => {
                assert_eq!(connection_id, 7);
                assert_eq!(bytes, b"over the tunnel");
            }
            other => panic!("expected TcpData, got {}", other.kind()),
        }

        // Relay closes its side; both pumps wind down without another
        // frame for the forgotten id.
        streams.close(7);
        pump.await.unwrap();
        assert_eq!(streams.count(), 0);
        assert!(out_rx.recv().await.is_none());

        let report = counters.drain();
        assert_eq!(report.connections, 1);
        assert_eq!(report.bytes_out, 15);
    }

    #[tokio::test]
    async fn test_open_local_connect_refused() {
        let streams = Arc::new(LocalStreams::new());
        let counters = Arc::new(TrafficCounters::default());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        // Port 1 refuses connections.
        open_local(9, "127.0.0.1:1".to_string(), streams.clone(), out_tx, counters).await;

        match expect_frame(&mut out_rx).await {
            ControlMessage::TcpError {
                connection_id,
                message,
            } => {
                assert_eq!(connection_id, 9);
                assert!(message.contains("connect"), "got: {message}");
            }
            other => panic!("expected TcpError, got {}", other.kind()),
        }
        assert_eq!(streams.count(), 0);
    }

    #[tokio::test]
    async fn test_relay_close_stops_read_pump() {
        // A local service that holds its socket open regardless of the
        // write-side shutdown, so only the close signal can end the
        // read pump.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            drop(socket);
        });

        let streams = Arc::new(LocalStreams::new());
        let counters = Arc::new(TrafficCounters::default());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(open_local(
            11,
            addr,
            streams.clone(),
            out_tx,
            counters,
        ));

        match expect_frame(&mut out_rx).await {
            ControlMessage::TcpReady { connection_id } => assert_eq!(connection_id, 11),
            other => panic!("expected TcpReady, got {}", other.kind()),
        }

        streams.close(11);
        tokio::time::timeout(std::time::Duration::from_secs(2), pump)
            .await
            .expect("read pump kept running after close")
            .unwrap();
        assert_eq!(streams.count(), 0);
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_write_to_unknown_stream() {
        let streams = LocalStreams::new();
        assert!(!streams.write(42, b"nope".to_vec()));
        streams.close(42);
    }

    #[tokio::test]
    async fn test_close_all_ends_pumps() {
        let target = echo_server().await;
        let streams = Arc::new(LocalStreams::new());
        let counters = Arc::new(TrafficCounters::default());
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        let pump_a = tokio::spawn(open_local(
            1,
            target.clone(),
            streams.clone(),
            out_tx.clone(),
            counters.clone(),
        ));
        let pump_b = tokio::spawn(open_local(
            2,
            target,
            streams.clone(),
            out_tx,
            counters,
        ));

        for _ in 0..2 {
            match expect_frame(&mut out_rx).await {
                ControlMessage::TcpReady { .. } => {}
                other => panic!("expected TcpReady, got {}", other.kind()),
            }
        }

        streams.close_all();
        assert_eq!(streams.count(), 0);
        pump_a.await.unwrap();
        pump_b.await.unwrap();
    }
}
