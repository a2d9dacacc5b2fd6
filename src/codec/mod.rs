//! Codec module - serialization of message payloads.
//!
//! The transport only moves bytes. Codecs turn typed messages into package
//! payloads and back, and name the `content-type` that travels with them:
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (`to_vec_named`)
//! - [`JsonCodec`] - JSON using `serde_json`
//!
//! # Design
//!
//! Codecs are marker structs implementing [`MessageCodec`] with associated
//! functions rather than trait objects, so the codec is picked at compile time
//! (`OutboundPackage::encode::<JsonCodec, _>(&msg, destination)`).
//!
//! # Example
//!
//! ```
//! use amqp_transport::codec::{JsonCodec, MessageCodec, MsgPackCodec};
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//!
//! assert_eq!(JsonCodec::encode(&[1, 2]).unwrap(), b"[1,2]");
//! assert_eq!(JsonCodec::CONTENT_TYPE, "application/json");
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use crate::error::Result;

/// Payload serializer.
pub trait MessageCodec {
    /// Value of the `content-type` header for payloads of this codec.
    const CONTENT_TYPE: &'static str;

    /// Encode a value to payload bytes.
    fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>>;

    /// Decode payload bytes to a value.
    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T>;
}
