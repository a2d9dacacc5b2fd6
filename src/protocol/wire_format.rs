//! Wire format encoding and decoding.
//!
//! Implements the 7-byte AMQP 0-9-1 frame header and the frame-end marker:
//! ```text
//! ┌──────┬─────────┬──────────┬─────────────┬───────────┐
//! │ Type │ Channel │ Size     │ Payload     │ Frame end │
//! │ 1 b  │ uint16  │ uint32   │ Size bytes  │ 0xCE      │
//! └──────┴─────────┴──────────┴─────────────┴───────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{Result, TransportError};

/// Frame header size in bytes (type + channel + size).
pub const FRAME_HEADER_SIZE: usize = 7;

/// Marker byte terminating every frame.
pub const FRAME_END: u8 = 0xCE;

/// Bytes a frame adds around its payload (header + frame end).
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

/// Protocol header sent by the client before any frame.
pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

/// Frame max used until the broker's Tune arrives (and when it proposes 0).
pub const DEFAULT_FRAME_MAX: u32 = 0xFFFF;

/// Channel max used when the broker imposes no limit.
pub const DEFAULT_CHANNEL_MAX: u16 = 0xFFFF;

/// Smallest frame max a peer may negotiate.
pub const MIN_FRAME_MAX: u32 = 4096;

/// Frame type octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Method frame: class id, method id, arguments.
    Method,
    /// Content header: class, weight, body size, properties.
    Header,
    /// Content body chunk.
    Body,
    /// Heartbeat (always channel 0, empty payload).
    Heartbeat,
}

impl FrameType {
    /// Wire value of this frame type.
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::Method => 1,
            FrameType::Header => 2,
            FrameType::Body => 3,
            FrameType::Heartbeat => 8,
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameType::Method),
            2 => Ok(FrameType::Header),
            3 => Ok(FrameType::Body),
            8 => Ok(FrameType::Heartbeat),
            other => Err(TransportError::ProtocolViolation(format!(
                "Unknown frame type {}",
                other
            ))),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type.
    pub frame_type: FrameType,
    /// Channel id (0 = connection).
    pub channel: u16,
    /// Payload length in bytes (frame end excluded).
    pub payload_size: u32,
}

impl FrameHeader {
    /// Create a new header.
    pub fn new(frame_type: FrameType, channel: u16, payload_size: u32) -> Self {
        Self {
            frame_type,
            channel,
            payload_size,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use amqp_transport::protocol::{FrameHeader, FrameType};
    ///
    /// let header = FrameHeader::new(FrameType::Method, 1, 12);
    /// assert_eq!(header.encode(), [1, 0, 1, 0, 0, 0, 12]);
    /// ```
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0] = self.frame_type.as_u8();
        buf[1..3].copy_from_slice(&self.channel.to_be_bytes());
        buf[3..7].copy_from_slice(&self.payload_size.to_be_bytes());
        buf
    }

    /// Decode header from bytes.
    ///
    /// Returns `Ok(None)` if the buffer is too short and an error for an
    /// unknown frame type.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        Ok(Some(Self {
            frame_type: FrameType::try_from(buf[0])?,
            channel: u16::from_be_bytes([buf[1], buf[2]]),
            payload_size: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
        }))
    }

    /// Validate the header against the negotiated payload limit.
    ///
    /// Checks:
    /// - Payload size doesn't exceed max
    /// - Heartbeats travel on channel 0 with an empty payload
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_size > max_payload_size {
            return Err(TransportError::ProtocolViolation(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_size, max_payload_size
            )));
        }

        if self.frame_type == FrameType::Heartbeat && self.channel != 0 {
            return Err(TransportError::ProtocolViolation(format!(
                "Heartbeat frame on channel {}",
                self.channel
            )));
        }

        Ok(())
    }
}
