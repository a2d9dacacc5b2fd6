//! MessagePack payloads via `rmp-serde`.
//!
//! Structs are written as maps keyed by field name (`to_vec_named`), so
//! consumers on the bus that are not built from the same Rust types can
//! still read them.
//!
//! # Example
//!
//! ```
//! use amqp_transport::codec::{MessageCodec, MsgPackCodec};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct OrderShipped {
//!     order_id: u64,
//!     carrier: String,
//! }
//!
//! let event = OrderShipped { order_id: 42, carrier: "ups".to_string() };
//! let payload = MsgPackCodec::encode(&event).unwrap();
//! assert_eq!(MsgPackCodec::decode::<OrderShipped>(&payload).unwrap(), event);
//! ```

use super::MessageCodec;
use crate::error::Result;

/// MessagePack with struct-as-map encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl MessageCodec for MsgPackCodec {
    const CONTENT_TYPE: &'static str = "application/msgpack";

    fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct InventoryAdjusted {
        sku: String,
        delta: i32,
        warehouses: BTreeMap<String, u32>,
        note: Option<String>,
    }

    fn sample() -> InventoryAdjusted {
        InventoryAdjusted {
            sku: "A-100".to_string(),
            delta: -3,
            warehouses: [("berlin".to_string(), 12), ("lyon".to_string(), 0)].into(),
            note: None,
        }
    }

    #[test]
    fn test_event_survives_encoding() {
        let payload = MsgPackCodec::encode(&sample()).unwrap();
        let decoded: InventoryAdjusted = MsgPackCodec::decode(&payload).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn test_fields_are_named() {
        let payload = MsgPackCodec::encode(&sample()).unwrap();

        // fixmap with four entries, first key "sku"
        assert_eq!(payload[0], 0x84);
        assert_eq!(&payload[1..5], b"\xa3sku");
    }

    #[test]
    fn test_garbage_is_a_codec_error() {
        let err = MsgPackCodec::decode::<InventoryAdjusted>(b"{\"sku\":1}").unwrap_err();
        assert!(matches!(err, TransportError::Codec(_)));
    }
}
