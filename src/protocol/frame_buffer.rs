//! Reassembly of frames from socket reads.
//!
//! Reads arrive in arbitrary pieces. [`FrameBuffer`] keeps the unparsed tail
//! in one `BytesMut` and remembers a header it has already decoded, so a
//! large body frame is validated once and then just waited for.
//!
//! # Example
//!
//! ```
//! use amqp_transport::protocol::{Frame, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = Frame::heartbeat().to_bytes();
//!
//! assert!(buffer.push(&bytes[..3]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[3..]).unwrap();
//! assert_eq!(frames.len(), 1);
//! ```

use bytes::BytesMut;

use super::wire_format::{
    FrameHeader, DEFAULT_FRAME_MAX, FRAME_END, FRAME_HEADER_SIZE, FRAME_OVERHEAD,
};
use super::Frame;
use crate::error::{Result, TransportError};

/// Incremental frame parser.
#[derive(Debug)]
pub struct FrameBuffer {
    pending: BytesMut,
    /// Header of the frame whose payload is still incomplete.
    current: Option<FrameHeader>,
    /// Largest payload accepted, from the negotiated frame max.
    max_payload: u32,
}

impl FrameBuffer {
    /// Parser limited by the frame max that applies before Connection.Tune.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_FRAME_MAX - FRAME_OVERHEAD as u32)
    }

    pub fn with_max_payload(max_payload: u32) -> Self {
        Self {
            pending: BytesMut::with_capacity(64 * 1024),
            current: None,
            max_payload,
        }
    }

    /// Apply a negotiated frame max (`0` means no limit).
    pub fn set_frame_max(&mut self, frame_max: u32) {
        self.max_payload = match frame_max {
            0 => u32::MAX,
            max => max.saturating_sub(FRAME_OVERHEAD as u32),
        };
    }

    /// Append `data` and return every frame it completes, in wire order.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` for an unknown frame type, a payload over the
    /// limit, a heartbeat off channel 0 or a missing frame-end octet. The
    /// connection cannot continue after an error.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.pending.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            let header = match self.current {
                Some(header) => header,
                None => match FrameHeader::decode(&self.pending)? {
                    Some(header) => {
                        header.validate(self.max_payload)?;
                        let _ = self.pending.split_to(FRAME_HEADER_SIZE);
                        self.current = Some(header);
                        header
                    }
                    None => break,
                },
            };

            let size = header.payload_size as usize;
            if self.pending.len() <= size {
                break;
            }
            let payload = self.pending.split_to(size).freeze();
            let end = self.pending.split_to(1)[0];
            if end != FRAME_END {
                return Err(TransportError::ProtocolViolation(format!(
                    "Invalid frame end 0x{:02X} on channel {}",
                    end, header.channel
                )));
            }
            self.current = None;
            frames.push(Frame { header, payload });
        }
        Ok(frames)
    }

    /// Bytes held back for the next push.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.current.is_none()
    }

    /// Drop everything buffered, for reuse on a new connection.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.current = None;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
