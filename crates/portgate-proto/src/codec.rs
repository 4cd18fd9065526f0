//! Codec for encoding/decoding control channel frames

use crate::messages::ControlMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Control channel frame codec
///
/// Format on the wire: `[length: u32 big-endian][payload: bincode message]`.
pub struct FrameCodec;

impl FrameCodec {
    /// Maximum frame payload size (16MB)
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Encode a control message into a single frame
    pub fn encode(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one control message from the front of the buffer
    ///
    /// Returns Ok(Some(message)) if a complete frame was decoded,
    /// Ok(None) if more data is needed,
    /// Err on a malformed or oversized frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        // Need at least 4 bytes for the length header
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let payload = buf.split_to(length);

        let msg: ControlMessage = bincode::deserialize(&payload)?;

        Ok(Some(msg))
    }

    /// Decode every complete frame currently buffered
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<ControlMessage>, CodecError> {
        let mut messages = Vec::new();

        while let Some(msg) = Self::decode(buf)? {
            messages.push(msg);
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let msg = ControlMessage::Ping { timestamp: 12345 };

        let encoded = FrameCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded = FrameCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = ControlMessage::Pong { timestamp: 67890 };
        let encoded = FrameCodec::encode(&msg).unwrap();

        // Only the length header available
        let mut buf = BytesMut::from(&encoded[..4]);
        let result = FrameCodec::decode(&mut buf).unwrap();
        assert_eq!(result, None);

        // Rest of the frame arrives
        buf.extend_from_slice(&encoded[4..]);
        let result = FrameCodec::decode(&mut buf).unwrap();
        assert_eq!(result, Some(msg));
    }

    #[test]
    fn test_decode_split_mid_header() {
        let msg = ControlMessage::TcpEnd { connection_id: 3 };
        let encoded = FrameCodec::encode(&msg).unwrap();

        let mut buf = BytesMut::from(&encoded[..2]);
        assert_eq!(FrameCodec::decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[2..]);
        assert_eq!(FrameCodec::decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_decode_multiple() {
        let msg1 = ControlMessage::Ping { timestamp: 111 };
        let msg2 = ControlMessage::Pong { timestamp: 222 };

        let encoded1 = FrameCodec::encode(&msg1).unwrap();
        let encoded2 = FrameCodec::encode(&msg2).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded1);
        buf.extend_from_slice(&encoded2);

        let messages = FrameCodec::decode_all(&mut buf).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], msg1);
        assert_eq!(messages[1], msg2);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        let bogus_len = (FrameCodec::MAX_FRAME_SIZE as u32) + 1;
        buf.extend_from_slice(&bogus_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        match FrameCodec::decode(&mut buf) {
            Err(CodecError::FrameTooLarge(n)) => {
                assert_eq!(n, bogus_len as usize);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other.map(|m| m.map(|m| m.kind()))),
        }
    }

    #[test]
    fn test_tcp_data_payload_survives_framing() {
        let bytes: Vec<u8> = (0..128).map(|i| (i * 2) as u8).collect();
        let msg = ControlMessage::TcpData {
            connection_id: 42,
            bytes: bytes.clone(),
        };

        let encoded = FrameCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        match FrameCodec::decode(&mut buf).unwrap() {
            Some(ControlMessage::TcpData {
                connection_id,
                bytes: decoded,
            }) => {
                assert_eq!(connection_id, 42);
                assert_eq!(decoded, bytes);
            }
            other => panic!("expected TcpData, got {:?}", other),
        }
    }
}
