//! AMQP channels.
//!
//! A [`Channel`] is a cheap, cloneable handle: the channel's state lives in
//! the connection's reactor and every operation is a command sent to it.
//! Request methods wait for their `-Ok` reply; a broker-initiated
//! Channel.Close fails every operation still waiting on the channel.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::connection::{AwaitKind, Command, EngineHandle, Reply};
use crate::consumer::{Consumer, Delivery};
use crate::error::{Result, TransportError};
use crate::protocol::{
    ids, write_frame, BasicConsume, BasicProperties, BasicPublish, BasicQos, CloseReason,
    ContentHeader, ExchangeBind, ExchangeDeclare, FieldTable, FrameType, Method, MethodId,
    QueueBind, QueueDeclare, QueueDeclareOk, FRAME_OVERHEAD,
};

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Handle to an open channel.
#[derive(Debug, Clone)]
pub struct Channel {
    id: u16,
    engine: EngineHandle,
    frame_max: u32,
}

impl Channel {
    pub(crate) fn new(id: u16, engine: EngineHandle, frame_max: u32) -> Self {
        Self {
            id,
            engine,
            frame_max,
        }
    }

    /// Channel id on the connection.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Current lifecycle state. `Closed` once the reactor is gone.
    pub async fn state(&self) -> ChannelState {
        let channel = self.id;
        self.engine
            .call(|reply| Command::QueryChannel { channel, reply })
            .await
            .unwrap_or(ChannelState::Closed)
    }

    async fn call(&self, method: Method, expect: MethodId, kind: AwaitKind) -> Result<Method> {
        let bytes = crate::connection::method_frame(self.id, &method)?;
        self.engine.request(self.id, bytes, &[expect], kind).await
    }

    /// Write a method that has no reply; resolves once it is flushed.
    async fn send(&self, method: Method) -> Result<()> {
        let bytes = crate::connection::method_frame(self.id, &method)?;
        self.engine.write(self.id, bytes).await
    }

    pub async fn exchange_declare(&self, args: ExchangeDeclare) -> Result<()> {
        tracing::debug!(channel = self.id, exchange = %args.exchange, kind = %args.kind, "Declaring exchange");
        self.call(Method::ExchangeDeclare(args), ids::EXCHANGE_DECLARE_OK, AwaitKind::Reply)
            .await?;
        Ok(())
    }

    pub async fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<()> {
        tracing::debug!(channel = self.id, exchange, "Deleting exchange");
        self.call(
            Method::ExchangeDelete {
                exchange: exchange.to_string(),
                if_unused,
            },
            ids::EXCHANGE_DELETE_OK,
            AwaitKind::Reply,
        )
        .await?;
        Ok(())
    }

    /// Route messages from `source` to `destination`.
    pub async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        tracing::debug!(channel = self.id, destination, source, routing_key, "Binding exchange");
        let args = ExchangeBind {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
            arguments,
        };
        self.call(Method::ExchangeBind(args), ids::EXCHANGE_BIND_OK, AwaitKind::Reply)
            .await?;
        Ok(())
    }

    pub async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        tracing::debug!(channel = self.id, destination, source, routing_key, "Unbinding exchange");
        let args = ExchangeBind {
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
            arguments,
        };
        self.call(Method::ExchangeUnbind(args), ids::EXCHANGE_UNBIND_OK, AwaitKind::Reply)
            .await?;
        Ok(())
    }

    /// Declare a queue. An empty name asks the broker to generate one.
    pub async fn queue_declare(&self, args: QueueDeclare) -> Result<QueueDeclareOk> {
        tracing::debug!(channel = self.id, queue = %args.queue, "Declaring queue");
        match self
            .call(Method::QueueDeclare(args), ids::QUEUE_DECLARE_OK, AwaitKind::Reply)
            .await?
        {
            Method::QueueDeclareOk(ok) => Ok(ok),
            other => Err(unexpected(other)),
        }
    }

    /// Delete a queue, returning the number of messages it held.
    pub async fn queue_delete(&self, queue: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        tracing::debug!(channel = self.id, queue, "Deleting queue");
        let method = Method::QueueDelete {
            queue: queue.to_string(),
            if_unused,
            if_empty,
        };
        match self.call(method, ids::QUEUE_DELETE_OK, AwaitKind::Reply).await? {
            Method::QueueDeleteOk { message_count } => Ok(message_count),
            other => Err(unexpected(other)),
        }
    }

    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        tracing::debug!(channel = self.id, queue, exchange, routing_key, "Binding queue");
        let args = QueueBind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            arguments,
        };
        self.call(Method::QueueBind(args), ids::QUEUE_BIND_OK, AwaitKind::Reply)
            .await?;
        Ok(())
    }

    pub async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<()> {
        tracing::debug!(channel = self.id, queue, exchange, routing_key, "Unbinding queue");
        let args = QueueBind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            arguments,
        };
        self.call(Method::QueueUnbind(args), ids::QUEUE_UNBIND_OK, AwaitKind::Reply)
            .await?;
        Ok(())
    }

    /// Drop every ready message, returning how many were removed.
    pub async fn queue_purge(&self, queue: &str) -> Result<u32> {
        let method = Method::QueuePurge {
            queue: queue.to_string(),
        };
        match self.call(method, ids::QUEUE_PURGE_OK, AwaitKind::Reply).await? {
            Method::QueuePurgeOk { message_count } => Ok(message_count),
            other => Err(unexpected(other)),
        }
    }

    pub async fn qos(&self, prefetch_size: u32, prefetch_count: u16, global: bool) -> Result<()> {
        let args = BasicQos {
            prefetch_size,
            prefetch_count,
            global,
        };
        self.call(Method::BasicQos(args), ids::BASIC_QOS_OK, AwaitKind::Reply)
            .await?;
        Ok(())
    }

    /// Switch to publisher-confirm mode.
    ///
    /// Afterwards [`publish`](Self::publish) resolves when the broker acks
    /// the message and fails with `PublishRejected` on a nack.
    pub async fn confirm_select(&self) -> Result<()> {
        self.call(Method::ConfirmSelect, ids::CONFIRM_SELECT_OK, AwaitKind::ConfirmSelect)
            .await?;
        Ok(())
    }

    /// Publish one message.
    ///
    /// Resolves once the frames are on the socket, or on the broker's
    /// confirm when confirm mode is on.
    pub async fn publish(&self, args: BasicPublish, properties: BasicProperties, body: Bytes) -> Result<()> {
        tracing::debug!(
            channel = self.id,
            exchange = %args.exchange,
            routing_key = %args.routing_key,
            bytes = body.len(),
            "Publishing message"
        );
        let bytes = publish_frames(self.id, self.frame_max, &args, properties, &body)?;
        let channel = self.id;
        self.engine
            .call(|reply| Command::Publish {
                channel,
                bytes,
                reply,
            })
            .await?
    }

    /// Start a consumer with a caller-chosen tag. Deliveries go to `sink`.
    pub(crate) async fn basic_consume(
        &self,
        args: BasicConsume,
        sink: mpsc::UnboundedSender<Delivery>,
    ) -> Result<()> {
        let tag = args.consumer_tag.clone();
        self.engine.send(Command::RegisterConsumer {
            channel: self.id,
            tag: tag.clone(),
            sink,
        })?;
        let result = self
            .call(Method::BasicConsume(args), ids::BASIC_CONSUME_OK, AwaitKind::Reply)
            .await;
        if result.is_err() {
            let _ = self.engine.send(Command::RemoveConsumer {
                channel: self.id,
                tag,
            });
        }
        result.map(|_| ())
    }

    /// Consume `queue`; see [`Consumer`].
    pub async fn consume(&self, queue: &str) -> Result<Consumer> {
        Consumer::start(self, queue).await
    }

    /// Cancel a consumer. Its stream ends once Cancel-Ok arrives.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let method = Method::BasicCancel {
            consumer_tag: consumer_tag.to_string(),
            no_wait: false,
        };
        self.call(method, ids::BASIC_CANCEL_OK, AwaitKind::Cancel(consumer_tag.to_string()))
            .await?;
        Ok(())
    }

    /// Fetch one message synchronously. `None` when the queue is empty.
    pub async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Delivery>> {
        let method = Method::BasicGet {
            queue: queue.to_string(),
            no_ack,
        };
        let bytes = crate::connection::method_frame(self.id, &method)?;
        let reply = self
            .engine
            .request_reply(self.id, bytes, &[ids::BASIC_GET_OK, ids::BASIC_GET_EMPTY], AwaitKind::Get)
            .await?;
        match reply {
            Reply::Delivery(delivery) => Ok(delivery),
            Reply::Method(other) => Err(unexpected(other)),
        }
    }

    pub async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.send(Method::BasicAck {
            delivery_tag,
            multiple,
        })
        .await
    }

    pub async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.send(Method::BasicNack {
            delivery_tag,
            multiple,
            requeue,
        })
        .await
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.send(Method::BasicReject {
            delivery_tag,
            requeue,
        })
        .await
    }

    /// Close the channel and wait for Close-Ok.
    pub async fn close(&self, reply_code: u16, reply_text: &str) -> Result<()> {
        tracing::debug!(channel = self.id, reply_code, "Closing channel");
        self.call(
            Method::ChannelClose(CloseReason::new(reply_code, reply_text)),
            ids::CHANNEL_CLOSE_OK,
            AwaitKind::ChannelClose,
        )
        .await?;
        Ok(())
    }
}

fn unexpected(method: Method) -> TransportError {
    TransportError::ProtocolViolation(format!("Unexpected reply {}", method.id()))
}

/// Encode Basic.Publish, its content header and body frames.
///
/// The body is split into frames of at most `frame_max - 8` bytes; with
/// `frame_max == 0` (no limit) it goes in one frame. An empty body sends no
/// body frame.
pub(crate) fn publish_frames(
    channel: u16,
    frame_max: u32,
    args: &BasicPublish,
    properties: BasicProperties,
    body: &[u8],
) -> Result<Bytes> {
    let chunk_size = if frame_max == 0 {
        body.len().max(1)
    } else {
        (frame_max as usize).saturating_sub(FRAME_OVERHEAD).max(1)
    };
    let frames = body.len().div_ceil(chunk_size);

    let mut buf = BytesMut::with_capacity(128 + body.len() + frames * FRAME_OVERHEAD);
    Method::BasicPublish(args.clone()).write_frame(&mut buf, channel)?;

    let mut header = BytesMut::with_capacity(64);
    ContentHeader::basic(body.len() as u64, properties).encode(&mut header)?;
    write_frame(&mut buf, FrameType::Header, channel, &header);

    for chunk in body.chunks(chunk_size) {
        write_frame(&mut buf, FrameType::Body, channel, chunk);
    }
    Ok(buf.freeze())
}
