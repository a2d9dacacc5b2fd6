//! Packages: messages as the bus sees them.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::channel::Channel;
use crate::codec::MessageCodec;
use crate::consumer::Delivery;
use crate::error::Result;
use crate::protocol::{header_keys, BasicProperties, BasicPublish, FieldTable, FieldValue};

/// Delivery mode of messages that survive a broker restart.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Where a package is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPackage {
    pub payload: Bytes,
    pub headers: FieldTable,
    pub destination: Destination,
    /// Survive broker restarts (`delivery-mode` 2).
    pub persistent: bool,
    /// Return the message if no queue receives it.
    pub mandatory: bool,
    /// Return the message if no consumer can take it right away.
    pub immediate: bool,
    /// Per-message TTL.
    pub expires_after: Option<Duration>,
    /// Correlates log lines of one send.
    pub trace_id: Uuid,
}

impl OutboundPackage {
    pub fn new(payload: impl Into<Bytes>, destination: Destination) -> Self {
        Self {
            payload: payload.into(),
            headers: FieldTable::new(),
            destination,
            persistent: false,
            mandatory: false,
            immediate: false,
            expires_after: None,
            trace_id: Uuid::new_v4(),
        }
    }

    /// Serialize `value` with codec `C` and set the matching `content-type`.
    pub fn encode<C: MessageCodec, T: Serialize>(value: &T, destination: Destination) -> Result<Self> {
        let payload = C::encode(value)?;
        Ok(Self::new(payload, destination).with_header(header_keys::CONTENT_TYPE, C::CONTENT_TYPE))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn expires_after(mut self, ttl: Duration) -> Self {
        self.expires_after = Some(ttl);
        self
    }

    pub fn with_trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub(crate) fn publish_args(&self) -> BasicPublish {
        BasicPublish {
            exchange: self.destination.exchange.clone(),
            routing_key: self.destination.routing_key.clone(),
            mandatory: self.mandatory,
            immediate: self.immediate,
        }
    }

    /// Headers with persistence and expiration merged in and void values
    /// dropped, split into basic properties.
    pub(crate) fn properties(&self) -> BasicProperties {
        let mut headers = self.headers.clone();
        if self.persistent {
            headers.insert(
                header_keys::DELIVERY_MODE.to_string(),
                FieldValue::U8(PERSISTENT_DELIVERY_MODE),
            );
        }
        if let Some(ttl) = self.expires_after {
            headers.insert(
                header_keys::EXPIRATION.to_string(),
                FieldValue::LongString(ttl.as_millis().to_string()),
            );
        }
        headers.retain(|_, value| *value != FieldValue::Void);
        BasicProperties::from_header_map(headers)
    }
}

/// A received message.
///
/// Acknowledgement goes through the channel it arrived on.
#[derive(Debug, Clone)]
pub struct IncomingPackage {
    payload: Bytes,
    headers: FieldTable,
    delivery_tag: u64,
    redelivered: bool,
    queue: String,
    exchange: String,
    routing_key: String,
    channel: Channel,
}

impl IncomingPackage {
    pub(crate) fn new(queue: String, channel: Channel, delivery: Delivery) -> Self {
        Self {
            payload: delivery.body,
            headers: delivery.properties.into_header_map(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            queue,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            channel,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Properties and headers in one flat map.
    pub fn headers(&self) -> &FieldTable {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&FieldValue> {
        self.headers.get(key)
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Queue the package was consumed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Deserialize the payload with codec `C`.
    pub fn decode<C: MessageCodec, T: DeserializeOwned>(&self) -> Result<T> {
        C::decode(&self.payload)
    }

    pub async fn ack(&self) -> Result<()> {
        self.channel.ack(self.delivery_tag, false).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.channel.nack(self.delivery_tag, false, requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.channel.reject(self.delivery_tag, requeue).await
    }
}
