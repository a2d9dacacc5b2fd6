//! Frame struct with typed accessors.
//!
//! Represents a complete AMQP frame: type, channel and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use amqp_transport::protocol::{Frame, FrameType};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(FrameType::Body, 1, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.channel(), 1);
//! assert_eq!(frame.payload(), b"hello");
//! assert_eq!(frame.to_bytes().len(), 8 + 5);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{FrameHeader, FrameType, FRAME_END, FRAME_OVERHEAD};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: FrameHeader,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame; the header's size is taken from the payload.
    pub fn new(frame_type: FrameType, channel: u16, payload: Bytes) -> Self {
        Self {
            header: FrameHeader::new(frame_type, channel, payload.len() as u32),
            payload,
        }
    }

    /// The heartbeat frame (channel 0, empty payload).
    pub fn heartbeat() -> Self {
        Self::new(FrameType::Heartbeat, 0, Bytes::new())
    }

    /// Frame type.
    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    /// Channel the frame travels on.
    #[inline]
    pub fn channel(&self) -> u16 {
        self.header.channel
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Append the encoded frame (header, payload, frame end) to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        write_frame(buf, self.header.frame_type, self.header.channel, &self.payload);
    }

    /// Encode the frame as a standalone buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + self.payload.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Append one frame to `buf` without building a [`Frame`] first.
pub fn write_frame(buf: &mut BytesMut, frame_type: FrameType, channel: u16, payload: &[u8]) {
    buf.reserve(FRAME_OVERHEAD + payload.len());
    buf.put_slice(&FrameHeader::new(frame_type, channel, payload.len() as u32).encode());
    buf.put_slice(payload);
    buf.put_u8(FRAME_END);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FRAME_HEADER_SIZE;

    #[test]
    fn test_frame_creation() {
        let frame = Frame::new(FrameType::Method, 7, Bytes::from_static(b"hello"));

        assert_eq!(frame.frame_type(), FrameType::Method);
        assert_eq!(frame.channel(), 7);
        assert_eq!(frame.header.payload_size, 5);
        assert_eq!(frame.payload(), b"hello");
        assert_eq!(frame.payload_len(), 5);
    }

    #[test]
    fn test_heartbeat_frame_bytes() {
        let bytes = Frame::heartbeat().to_bytes();
        assert_eq!(&bytes[..], &[8, 0, 0, 0, 0, 0, 0, 0xCE]);
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame::new(FrameType::Body, 2, Bytes::from_static(b"abc"));
        let bytes = frame.to_bytes();

        assert_eq!(bytes.len(), FRAME_OVERHEAD + 3);
        assert_eq!(&bytes[..FRAME_HEADER_SIZE], &[3, 0, 2, 0, 0, 0, 3]);
        assert_eq!(&bytes[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + 3], b"abc");
        assert_eq!(bytes[bytes.len() - 1], FRAME_END);
    }

    #[test]
    fn test_write_frame_appends() {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, FrameType::Heartbeat, 0, &[]);
        write_frame(&mut buf, FrameType::Body, 1, b"x");

        assert_eq!(buf.len(), FRAME_OVERHEAD * 2 + 1);
    }

    #[test]
    fn test_frame_roundtrip_through_buffer() {
        use super::super::FrameBuffer;

        let frame = Frame::new(FrameType::Body, 9, Bytes::from_static(b"0123456789"));

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&frame.to_bytes()).unwrap();

        assert_eq!(frames, vec![frame]);
    }
}
