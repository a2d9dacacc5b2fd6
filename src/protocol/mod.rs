//! Protocol module - AMQP 0-9-1 wire format, framing and method codec.
//!
//! This module is sans-I/O:
//! - 7-byte frame header encoding/decoding and the frame-end marker
//! - Frame buffer for accumulating partial reads
//! - Field tables and the primitive argument codec
//! - Methods and content headers

mod content;
mod frame;
mod frame_buffer;
mod method;
mod types;
mod wire_format;

pub use content::{flags as property_flags, keys as header_keys, BasicProperties, ContentHeader, BASIC_CLASS_ID};
pub use frame::{write_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use method::{
    ids, BasicConsume, BasicDeliver, BasicGetOk, BasicPublish, BasicQos, BasicReturn,
    CloseReason, ConnectionStart, ConnectionStartOk, ExchangeBind, ExchangeDeclare, Method,
    MethodId, QueueBind, QueueDeclare, QueueDeclareOk, Tune,
};
pub use types::{AmqpBufMut, Decoder, FieldTable, FieldValue};
pub use wire_format::{
    FrameHeader, FrameType, DEFAULT_CHANNEL_MAX, DEFAULT_FRAME_MAX, FRAME_END, FRAME_HEADER_SIZE,
    FRAME_OVERHEAD, MIN_FRAME_MAX, PROTOCOL_HEADER,
};
