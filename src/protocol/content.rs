//! Content header frames and basic properties.
//!
//! ```text
//! ┌──────────┬────────┬───────────┬────────────────┬────────────┐
//! │ Class id │ Weight │ Body size │ Property flags │ Properties │
//! │ uint16   │ uint16 │ uint64    │ uint16         │ present    │
//! └──────────┴────────┴───────────┴────────────────┴────────────┘
//! ```
//!
//! Each property is written only when its flag bit is set, highest bit first.
//!
//! Messages travel with a flat header map on the bus side. Well-known keys
//! (`content-type`, `delivery-mode`, `expiration`, ...) are carried as AMQP
//! properties; everything else goes into the `headers` table.

use bytes::{BufMut, Bytes, BytesMut};

use super::types::{AmqpBufMut, Decoder, FieldTable, FieldValue};
use crate::error::{Result, TransportError};

/// Class id of the basic class, the only content class in use.
pub const BASIC_CLASS_ID: u16 = 60;

/// Property flag bits.
pub mod flags {
    pub const CONTENT_TYPE: u16 = 1 << 15;
    pub const CONTENT_ENCODING: u16 = 1 << 14;
    pub const HEADERS: u16 = 1 << 13;
    pub const DELIVERY_MODE: u16 = 1 << 12;
    pub const PRIORITY: u16 = 1 << 11;
    pub const CORRELATION_ID: u16 = 1 << 10;
    pub const REPLY_TO: u16 = 1 << 9;
    pub const EXPIRATION: u16 = 1 << 8;
    pub const MESSAGE_ID: u16 = 1 << 7;
    pub const TIMESTAMP: u16 = 1 << 6;
    pub const TYPE: u16 = 1 << 5;
    pub const USER_ID: u16 = 1 << 4;
    pub const APP_ID: u16 = 1 << 3;
    pub const CLUSTER_ID: u16 = 1 << 2;
    /// A second flag word follows; not used by basic.
    pub const CONTINUATION: u16 = 1;
}

/// Header map keys mapped onto properties.
pub mod keys {
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CONTENT_ENCODING: &str = "content-encoding";
    pub const DELIVERY_MODE: &str = "delivery-mode";
    pub const PRIORITY: &str = "priority";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const REPLY_TO: &str = "reply-to";
    pub const EXPIRATION: &str = "expiration";
    pub const MESSAGE_ID: &str = "message-id";
    pub const TIMESTAMP: &str = "timestamp";
    pub const TYPE: &str = "type";
    pub const USER_ID: &str = "user-id";
    pub const APP_ID: &str = "app-id";
    pub const CLUSTER_ID: &str = "cluster-id";
}

/// Basic class content properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    /// 1 = transient, 2 = persistent.
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds, as a decimal string.
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

fn str_value(value: FieldValue) -> Option<String> {
    match value {
        FieldValue::LongString(s) => Some(s),
        other => other.as_i64().map(|n| n.to_string()),
    }
}

fn put_opt(buf: &mut BytesMut, value: &Option<String>) -> Result<()> {
    if let Some(s) = value {
        buf.put_short_str(s)?;
    }
    Ok(())
}

fn octet_value(value: &FieldValue) -> Option<u8> {
    match value {
        FieldValue::LongString(s) => s.parse().ok(),
        other => other.as_i64().and_then(|n| u8::try_from(n).ok()),
    }
}

impl BasicProperties {
    /// Split a flat header map into properties and the remaining headers.
    ///
    /// Values of well-known keys that don't fit their property type stay in
    /// the headers table.
    pub fn from_header_map(mut map: FieldTable) -> Self {
        let mut take_str = |key: &str| -> Option<String> {
            let value = map.remove(key)?;
            match str_value(value.clone()) {
                Some(s) => Some(s),
                None => {
                    map.insert(key.to_string(), value);
                    None
                }
            }
        };

        let mut props = BasicProperties {
            content_type: take_str(keys::CONTENT_TYPE),
            content_encoding: take_str(keys::CONTENT_ENCODING),
            correlation_id: take_str(keys::CORRELATION_ID),
            reply_to: take_str(keys::REPLY_TO),
            expiration: take_str(keys::EXPIRATION),
            message_id: take_str(keys::MESSAGE_ID),
            kind: take_str(keys::TYPE),
            user_id: take_str(keys::USER_ID),
            app_id: take_str(keys::APP_ID),
            cluster_id: take_str(keys::CLUSTER_ID),
            ..Default::default()
        };

        if let Some(mode) = map.get(keys::DELIVERY_MODE).and_then(octet_value) {
            props.delivery_mode = Some(mode);
            map.remove(keys::DELIVERY_MODE);
        }
        if let Some(priority) = map.get(keys::PRIORITY).and_then(octet_value) {
            props.priority = Some(priority);
            map.remove(keys::PRIORITY);
        }
        if let Some(ts) = map
            .get(keys::TIMESTAMP)
            .and_then(FieldValue::as_i64)
            .and_then(|n| u64::try_from(n).ok())
        {
            props.timestamp = Some(ts);
            map.remove(keys::TIMESTAMP);
        }

        if !map.is_empty() {
            props.headers = Some(map);
        }
        props
    }

    /// Flatten properties back into one header map.
    pub fn into_header_map(self) -> FieldTable {
        let mut map = self.headers.unwrap_or_default();
        let strings = [
            (keys::CONTENT_TYPE, self.content_type),
            (keys::CONTENT_ENCODING, self.content_encoding),
            (keys::CORRELATION_ID, self.correlation_id),
            (keys::REPLY_TO, self.reply_to),
            (keys::EXPIRATION, self.expiration),
            (keys::MESSAGE_ID, self.message_id),
            (keys::TYPE, self.kind),
            (keys::USER_ID, self.user_id),
            (keys::APP_ID, self.app_id),
            (keys::CLUSTER_ID, self.cluster_id),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                map.insert(key.to_string(), FieldValue::LongString(value));
            }
        }
        if let Some(mode) = self.delivery_mode {
            map.insert(keys::DELIVERY_MODE.to_string(), FieldValue::U8(mode));
        }
        if let Some(priority) = self.priority {
            map.insert(keys::PRIORITY.to_string(), FieldValue::U8(priority));
        }
        if let Some(ts) = self.timestamp {
            map.insert(keys::TIMESTAMP.to_string(), FieldValue::Timestamp(ts));
        }
        map
    }

    fn flags(&self) -> u16 {
        let mut bits = 0;
        let mut set = |present: bool, flag: u16| {
            if present {
                bits |= flag;
            }
        };
        set(self.content_type.is_some(), flags::CONTENT_TYPE);
        set(self.content_encoding.is_some(), flags::CONTENT_ENCODING);
        set(self.headers.is_some(), flags::HEADERS);
        set(self.delivery_mode.is_some(), flags::DELIVERY_MODE);
        set(self.priority.is_some(), flags::PRIORITY);
        set(self.correlation_id.is_some(), flags::CORRELATION_ID);
        set(self.reply_to.is_some(), flags::REPLY_TO);
        set(self.expiration.is_some(), flags::EXPIRATION);
        set(self.message_id.is_some(), flags::MESSAGE_ID);
        set(self.timestamp.is_some(), flags::TIMESTAMP);
        set(self.kind.is_some(), flags::TYPE);
        set(self.user_id.is_some(), flags::USER_ID);
        set(self.app_id.is_some(), flags::APP_ID);
        set(self.cluster_id.is_some(), flags::CLUSTER_ID);
        bits
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.flags());

        put_opt(buf, &self.content_type)?;
        put_opt(buf, &self.content_encoding)?;
        if let Some(headers) = &self.headers {
            buf.put_table(headers)?;
        }
        if let Some(mode) = self.delivery_mode {
            buf.put_u8(mode);
        }
        if let Some(priority) = self.priority {
            buf.put_u8(priority);
        }
        put_opt(buf, &self.correlation_id)?;
        put_opt(buf, &self.reply_to)?;
        put_opt(buf, &self.expiration)?;
        put_opt(buf, &self.message_id)?;
        if let Some(ts) = self.timestamp {
            buf.put_u64(ts);
        }
        put_opt(buf, &self.kind)?;
        put_opt(buf, &self.user_id)?;
        put_opt(buf, &self.app_id)?;
        put_opt(buf, &self.cluster_id)?;
        Ok(())
    }

    fn decode(d: &mut Decoder) -> Result<Self> {
        let bits = d.u16()?;
        if bits & flags::CONTINUATION != 0 {
            return Err(TransportError::ProtocolViolation(
                "Property flag continuation is not supported".into(),
            ));
        }

        let has = |flag: u16| bits & flag != 0;
        let mut props = BasicProperties::default();

        if has(flags::CONTENT_TYPE) {
            props.content_type = Some(d.short_str()?);
        }
        if has(flags::CONTENT_ENCODING) {
            props.content_encoding = Some(d.short_str()?);
        }
        if has(flags::HEADERS) {
            props.headers = Some(d.table()?);
        }
        if has(flags::DELIVERY_MODE) {
            props.delivery_mode = Some(d.u8()?);
        }
        if has(flags::PRIORITY) {
            props.priority = Some(d.u8()?);
        }
        if has(flags::CORRELATION_ID) {
            props.correlation_id = Some(d.short_str()?);
        }
        if has(flags::REPLY_TO) {
            props.reply_to = Some(d.short_str()?);
        }
        if has(flags::EXPIRATION) {
            props.expiration = Some(d.short_str()?);
        }
        if has(flags::MESSAGE_ID) {
            props.message_id = Some(d.short_str()?);
        }
        if has(flags::TIMESTAMP) {
            props.timestamp = Some(d.u64()?);
        }
        if has(flags::TYPE) {
            props.kind = Some(d.short_str()?);
        }
        if has(flags::USER_ID) {
            props.user_id = Some(d.short_str()?);
        }
        if has(flags::APP_ID) {
            props.app_id = Some(d.short_str()?);
        }
        if has(flags::CLUSTER_ID) {
            props.cluster_id = Some(d.short_str()?);
        }
        Ok(props)
    }
}

/// Decoded content header frame payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    pub class_id: u16,
    /// Always zero.
    pub weight: u16,
    /// Total size of the body frames that follow.
    pub body_size: u64,
    pub properties: BasicProperties,
}

impl ContentHeader {
    /// Header for a basic-class body of `body_size` bytes.
    pub fn basic(body_size: u64, properties: BasicProperties) -> Self {
        Self {
            class_id: BASIC_CLASS_ID,
            weight: 0,
            body_size,
            properties,
        }
    }

    /// Append the header payload to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.class_id);
        buf.put_u16(self.weight);
        buf.put_u64(self.body_size);
        self.properties.encode(buf)
    }

    /// Decode a content header frame payload.
    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut d = Decoder::new(payload);
        Ok(Self {
            class_id: d.u16()?,
            weight: d.u16()?,
            body_size: d.u64()?,
            properties: BasicProperties::decode(&mut d)?,
        })
    }
}
