//! Consumers: message assembly and the package stream.
//!
//! A delivered message arrives as three kinds of frames on its channel:
//!
//! ```text
//! Basic.Deliver ─► content header (body size) ─► body frame ... body frame
//! ```
//!
//! [`DeliveryAssembler`] buffers them until the announced body size is
//! complete and yields one [`Delivery`]. The engine routes it by consumer tag
//! to the consumer's [`PackageStream`], which turns deliveries into
//! [`IncomingPackage`]s.
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//!
//! let consumer = channel.consume("orders.q").await?;
//! let (control, mut packages) = consumer.into_parts();
//!
//! while let Some(package) = packages.next().await {
//!     println!("{:?}", package.payload());
//!     package.ack().await?;
//! }
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channel::Channel;
use crate::error::{Result, TransportError};
use crate::protocol::{BasicConsume, BasicProperties, ContentHeader, Method};
use crate::transport::IncomingPackage;

/// Longest queue-name prefix used in generated consumer tags.
const TAG_PREFIX_MAX: usize = 200;

/// A fully assembled message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel the message arrived on.
    pub channel: u16,
    /// Consumer that received it; `None` for Basic.Get and returns.
    pub consumer_tag: Option<String>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// Method that started a content sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Origin {
    Deliver,
    Get { message_count: u32 },
    Return { reply_code: u16, reply_text: String },
}

#[derive(Debug, Default)]
enum Stage {
    #[default]
    Idle,
    AwaitingHeader {
        origin: Origin,
        delivery: Delivery,
    },
    AwaitingBody {
        origin: Origin,
        delivery: Delivery,
        expected: u64,
        body: BytesMut,
    },
}

/// Per-channel content reassembly.
#[derive(Debug)]
pub(crate) struct DeliveryAssembler {
    channel: u16,
    stage: Stage,
}

impl DeliveryAssembler {
    pub fn new(channel: u16) -> Self {
        Self {
            channel,
            stage: Stage::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.stage, Stage::Idle)
    }

    /// Start a content sequence from Basic.Deliver, Basic.GetOk or Basic.Return.
    ///
    /// An unfinished previous sequence is discarded.
    pub fn begin(&mut self, method: Method) -> Result<()> {
        if !self.is_idle() {
            tracing::warn!(channel = self.channel, "Content sequence interrupted by a new method");
        }

        let empty = |exchange: String, routing_key: String| Delivery {
            channel: self.channel,
            consumer_tag: None,
            delivery_tag: 0,
            redelivered: false,
            exchange,
            routing_key,
            properties: BasicProperties::default(),
            body: Bytes::new(),
        };

        let (origin, delivery) = match method {
            Method::BasicDeliver(m) => (
                Origin::Deliver,
                Delivery {
                    consumer_tag: Some(m.consumer_tag),
                    delivery_tag: m.delivery_tag,
                    redelivered: m.redelivered,
                    ..empty(m.exchange, m.routing_key)
                },
            ),
            Method::BasicGetOk(m) => (
                Origin::Get {
                    message_count: m.message_count,
                },
                Delivery {
                    delivery_tag: m.delivery_tag,
                    redelivered: m.redelivered,
                    ..empty(m.exchange, m.routing_key)
                },
            ),
            Method::BasicReturn(m) => (
                Origin::Return {
                    reply_code: m.reply_code,
                    reply_text: m.reply_text,
                },
                empty(m.exchange, m.routing_key),
            ),
            other => {
                self.stage = Stage::Idle;
                return Err(TransportError::ProtocolViolation(format!(
                    "Method {} does not carry content",
                    other.id()
                )));
            }
        };

        self.stage = Stage::AwaitingHeader { origin, delivery };
        Ok(())
    }

    /// Feed the content header. Completes immediately for an empty body.
    pub fn header(&mut self, header: ContentHeader) -> Result<Option<(Origin, Delivery)>> {
        match std::mem::take(&mut self.stage) {
            Stage::AwaitingHeader {
                origin,
                mut delivery,
            } => {
                delivery.properties = header.properties;
                if header.body_size == 0 {
                    return Ok(Some((origin, delivery)));
                }
                let capacity = usize::try_from(header.body_size).unwrap_or(usize::MAX).min(1 << 20);
                self.stage = Stage::AwaitingBody {
                    origin,
                    delivery,
                    expected: header.body_size,
                    body: BytesMut::with_capacity(capacity),
                };
                Ok(None)
            }
            _ => Err(TransportError::ProtocolViolation(format!(
                "Unexpected content header on channel #{}",
                self.channel
            ))),
        }
    }

    /// Feed one body frame.
    pub fn body(&mut self, chunk: Bytes) -> Result<Option<(Origin, Delivery)>> {
        match std::mem::take(&mut self.stage) {
            Stage::AwaitingBody {
                origin,
                mut delivery,
                expected,
                mut body,
            } => {
                let received = body.len() as u64 + chunk.len() as u64;
                if received > expected {
                    return Err(TransportError::ProtocolViolation(format!(
                        "Body of {} bytes exceeds announced size {}",
                        received, expected
                    )));
                }
                body.extend_from_slice(&chunk);
                if received == expected {
                    delivery.body = body.freeze();
                    return Ok(Some((origin, delivery)));
                }
                self.stage = Stage::AwaitingBody {
                    origin,
                    delivery,
                    expected,
                    body,
                };
                Ok(None)
            }
            _ => Err(TransportError::ProtocolViolation(format!(
                "Unexpected body frame on channel #{}",
                self.channel
            ))),
        }
    }
}

/// Handle that can stop a running consumer.
#[derive(Debug, Clone)]
pub struct ConsumerControl {
    tag: String,
    queue: String,
    channel: Channel,
}

impl ConsumerControl {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Send Basic.Cancel and wait for Cancel-Ok. The stream then ends.
    pub async fn stop(&self) -> Result<()> {
        self.channel.cancel(&self.tag).await?;
        tracing::debug!(queue = %self.queue, consumer_tag = %self.tag, "Consumer stopped");
        Ok(())
    }
}

/// Stream of packages received by one consumer.
///
/// Ends (yields `None`) once the consumer is cancelled, its channel closes or
/// the connection goes away.
#[derive(Debug)]
pub struct PackageStream {
    queue: String,
    channel: Channel,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Stream for PackageStream {
    type Item = IncomingPackage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.rx.poll_recv(cx).map(|delivery| {
            delivery.map(|d| IncomingPackage::new(this.queue.clone(), this.channel.clone(), d))
        })
    }
}

/// A consumer registered on a channel for one queue.
#[derive(Debug)]
pub struct Consumer {
    control: ConsumerControl,
    stream: PackageStream,
}

impl Consumer {
    /// Register a consumer for `queue` on `channel`.
    ///
    /// The tag is generated here so the delivery sink exists before
    /// Basic.Consume reaches the broker.
    pub async fn start(channel: &Channel, queue: &str) -> Result<Self> {
        let prefix: String = queue.chars().take(TAG_PREFIX_MAX).collect();
        let tag = format!("{}-{}", prefix, Uuid::new_v4());
        let (sink, rx) = mpsc::unbounded_channel();

        channel
            .basic_consume(
                BasicConsume {
                    queue: queue.to_string(),
                    consumer_tag: tag.clone(),
                    ..Default::default()
                },
                sink,
            )
            .await?;

        tracing::debug!(queue, consumer_tag = %tag, channel = channel.id(), "Consumer started");

        Ok(Self {
            control: ConsumerControl {
                tag,
                queue: queue.to_string(),
                channel: channel.clone(),
            },
            stream: PackageStream {
                queue: queue.to_string(),
                channel: channel.clone(),
                rx,
            },
        })
    }

    pub fn tag(&self) -> &str {
        &self.control.tag
    }

    pub fn queue(&self) -> &str {
        &self.control.queue
    }

    /// Split into the stop handle and the package stream.
    pub fn into_parts(self) -> (ConsumerControl, PackageStream) {
        (self.control, self.stream)
    }

    /// Cancel the consumer.
    pub async fn stop(self) -> Result<()> {
        self.control.stop().await
    }
}

impl Stream for Consumer {
    type Item = IncomingPackage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().stream).poll_next(cx)
    }
}
