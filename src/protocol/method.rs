//! AMQP 0-9-1 methods.
//!
//! A method frame's payload is `class id (u16) | method id (u16) | arguments`.
//! [`Method`] covers every method the client sends or handles, in both
//! directions, so the same type serves the connection engine and the
//! in-process test broker. Anything else decodes as [`Method::Other`].
//!
//! Reserved fields (`ticket`, `out-of-band`, `known-hosts`, ...) are written
//! as zero values and skipped on decode. `no-wait` bits are always written as
//! `false`: every request the client makes waits for its reply.

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::write_frame;
use super::types::{AmqpBufMut, Decoder, FieldTable};
use super::wire_format::FrameType;
use crate::error::{Result, TransportError};

/// Class and method id pair identifying a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId {
    /// Class id (10 = connection, 20 = channel, ...).
    pub class_id: u16,
    /// Method id within the class.
    pub method_id: u16,
}

impl MethodId {
    /// Build an id.
    pub const fn new(class_id: u16, method_id: u16) -> Self {
        Self {
            class_id,
            method_id,
        }
    }
}

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.class_id, self.method_id)
    }
}

/// Method id constants.
pub mod ids {
    use super::MethodId;

    pub const CONNECTION_START: MethodId = MethodId::new(10, 10);
    pub const CONNECTION_START_OK: MethodId = MethodId::new(10, 11);
    pub const CONNECTION_TUNE: MethodId = MethodId::new(10, 30);
    pub const CONNECTION_TUNE_OK: MethodId = MethodId::new(10, 31);
    pub const CONNECTION_OPEN: MethodId = MethodId::new(10, 40);
    pub const CONNECTION_OPEN_OK: MethodId = MethodId::new(10, 41);
    pub const CONNECTION_CLOSE: MethodId = MethodId::new(10, 50);
    pub const CONNECTION_CLOSE_OK: MethodId = MethodId::new(10, 51);
    pub const CONNECTION_BLOCKED: MethodId = MethodId::new(10, 60);
    pub const CONNECTION_UNBLOCKED: MethodId = MethodId::new(10, 61);

    pub const CHANNEL_OPEN: MethodId = MethodId::new(20, 10);
    pub const CHANNEL_OPEN_OK: MethodId = MethodId::new(20, 11);
    pub const CHANNEL_FLOW: MethodId = MethodId::new(20, 20);
    pub const CHANNEL_FLOW_OK: MethodId = MethodId::new(20, 21);
    pub const CHANNEL_CLOSE: MethodId = MethodId::new(20, 40);
    pub const CHANNEL_CLOSE_OK: MethodId = MethodId::new(20, 41);

    pub const EXCHANGE_DECLARE: MethodId = MethodId::new(40, 10);
    pub const EXCHANGE_DECLARE_OK: MethodId = MethodId::new(40, 11);
    pub const EXCHANGE_DELETE: MethodId = MethodId::new(40, 20);
    pub const EXCHANGE_DELETE_OK: MethodId = MethodId::new(40, 21);
    pub const EXCHANGE_BIND: MethodId = MethodId::new(40, 30);
    pub const EXCHANGE_BIND_OK: MethodId = MethodId::new(40, 31);
    pub const EXCHANGE_UNBIND: MethodId = MethodId::new(40, 40);
    pub const EXCHANGE_UNBIND_OK: MethodId = MethodId::new(40, 51);

    pub const QUEUE_DECLARE: MethodId = MethodId::new(50, 10);
    pub const QUEUE_DECLARE_OK: MethodId = MethodId::new(50, 11);
    pub const QUEUE_BIND: MethodId = MethodId::new(50, 20);
    pub const QUEUE_BIND_OK: MethodId = MethodId::new(50, 21);
    pub const QUEUE_PURGE: MethodId = MethodId::new(50, 30);
    pub const QUEUE_PURGE_OK: MethodId = MethodId::new(50, 31);
    pub const QUEUE_DELETE: MethodId = MethodId::new(50, 40);
    pub const QUEUE_DELETE_OK: MethodId = MethodId::new(50, 41);
    pub const QUEUE_UNBIND: MethodId = MethodId::new(50, 50);
    pub const QUEUE_UNBIND_OK: MethodId = MethodId::new(50, 51);

    pub const BASIC_QOS: MethodId = MethodId::new(60, 10);
    pub const BASIC_QOS_OK: MethodId = MethodId::new(60, 11);
    pub const BASIC_CONSUME: MethodId = MethodId::new(60, 20);
    pub const BASIC_CONSUME_OK: MethodId = MethodId::new(60, 21);
    pub const BASIC_CANCEL: MethodId = MethodId::new(60, 30);
    pub const BASIC_CANCEL_OK: MethodId = MethodId::new(60, 31);
    pub const BASIC_PUBLISH: MethodId = MethodId::new(60, 40);
    pub const BASIC_RETURN: MethodId = MethodId::new(60, 50);
    pub const BASIC_DELIVER: MethodId = MethodId::new(60, 60);
    pub const BASIC_GET: MethodId = MethodId::new(60, 70);
    pub const BASIC_GET_OK: MethodId = MethodId::new(60, 71);
    pub const BASIC_GET_EMPTY: MethodId = MethodId::new(60, 72);
    pub const BASIC_ACK: MethodId = MethodId::new(60, 80);
    pub const BASIC_REJECT: MethodId = MethodId::new(60, 90);
    pub const BASIC_NACK: MethodId = MethodId::new(60, 120);

    pub const CONFIRM_SELECT: MethodId = MethodId::new(85, 10);
    pub const CONFIRM_SELECT_OK: MethodId = MethodId::new(85, 11);
}

/// Connection.Start arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStart {
    pub version_major: u8,
    pub version_minor: u8,
    pub server_properties: FieldTable,
    /// Space separated SASL mechanisms.
    pub mechanisms: String,
    pub locales: String,
}

/// Connection.StartOk arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStartOk {
    pub client_properties: FieldTable,
    pub mechanism: String,
    /// SASL response (`\0user\0password` for PLAIN).
    pub response: Bytes,
    pub locale: String,
}

/// Connection.Tune / TuneOk arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tune {
    pub channel_max: u16,
    pub frame_max: u32,
    /// Heartbeat interval in seconds (0 = disabled).
    pub heartbeat: u16,
}

/// Connection.Close / Channel.Close arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseReason {
    pub reply_code: u16,
    pub reply_text: String,
    /// Method that caused the close, zero when none.
    pub class_id: u16,
    pub method_id: u16,
}

impl CloseReason {
    /// A close not caused by a specific method.
    pub fn new(reply_code: u16, reply_text: impl Into<String>) -> Self {
        Self {
            reply_code,
            reply_text: reply_text.into(),
            class_id: 0,
            method_id: 0,
        }
    }
}

/// Exchange.Declare arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeDeclare {
    pub exchange: String,
    pub kind: String,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

/// Exchange.Bind / Exchange.Unbind arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExchangeBind {
    pub destination: String,
    pub source: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

/// Queue.Declare arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDeclare {
    pub queue: String,
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

/// Queue.DeclareOk arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDeclareOk {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Queue.Bind / Queue.Unbind arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueBind {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

/// Basic.Qos arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BasicQos {
    pub prefetch_size: u32,
    pub prefetch_count: u16,
    pub global: bool,
}

/// Basic.Consume arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicConsume {
    pub queue: String,
    pub consumer_tag: String,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
}

/// Basic.Publish arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicPublish {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
}

/// Basic.Return arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicReturn {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Basic.Deliver arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicDeliver {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// Basic.GetOk arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicGetOk {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub message_count: u32,
}

/// A decoded method.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionStart(ConnectionStart),
    ConnectionStartOk(ConnectionStartOk),
    ConnectionTune(Tune),
    ConnectionTuneOk(Tune),
    ConnectionOpen { virtual_host: String },
    ConnectionOpenOk,
    ConnectionClose(CloseReason),
    ConnectionCloseOk,
    ConnectionBlocked { reason: String },
    ConnectionUnblocked,

    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow { active: bool },
    ChannelFlowOk { active: bool },
    ChannelClose(CloseReason),
    ChannelCloseOk,

    ExchangeDeclare(ExchangeDeclare),
    ExchangeDeclareOk,
    ExchangeDelete { exchange: String, if_unused: bool },
    ExchangeDeleteOk,
    ExchangeBind(ExchangeBind),
    ExchangeBindOk,
    ExchangeUnbind(ExchangeBind),
    ExchangeUnbindOk,

    QueueDeclare(QueueDeclare),
    QueueDeclareOk(QueueDeclareOk),
    QueueBind(QueueBind),
    QueueBindOk,
    QueuePurge { queue: String },
    QueuePurgeOk { message_count: u32 },
    QueueDelete { queue: String, if_unused: bool, if_empty: bool },
    QueueDeleteOk { message_count: u32 },
    QueueUnbind(QueueBind),
    QueueUnbindOk,

    BasicQos(BasicQos),
    BasicQosOk,
    BasicConsume(BasicConsume),
    BasicConsumeOk { consumer_tag: String },
    /// Sent by the client to stop a consumer, or by the broker when the
    /// queue went away (then usually with `no_wait` set).
    BasicCancel { consumer_tag: String, no_wait: bool },
    BasicCancelOk { consumer_tag: String },
    BasicPublish(BasicPublish),
    BasicReturn(BasicReturn),
    BasicDeliver(BasicDeliver),
    BasicGet { queue: String, no_ack: bool },
    BasicGetOk(BasicGetOk),
    BasicGetEmpty,
    BasicAck { delivery_tag: u64, multiple: bool },
    BasicReject { delivery_tag: u64, requeue: bool },
    BasicNack { delivery_tag: u64, multiple: bool, requeue: bool },

    ConfirmSelect,
    ConfirmSelectOk,

    /// A method this crate does not model; arguments kept raw.
    Other { id: MethodId, arguments: Bytes },
}

impl Method {
    /// Class and method id.
    pub fn id(&self) -> MethodId {
        match self {
            Method::ConnectionStart(_) => ids::CONNECTION_START,
            Method::ConnectionStartOk(_) => ids::CONNECTION_START_OK,
            Method::ConnectionTune(_) => ids::CONNECTION_TUNE,
            Method::ConnectionTuneOk(_) => ids::CONNECTION_TUNE_OK,
            Method::ConnectionOpen { .. } => ids::CONNECTION_OPEN,
            Method::ConnectionOpenOk => ids::CONNECTION_OPEN_OK,
            Method::ConnectionClose(_) => ids::CONNECTION_CLOSE,
            Method::ConnectionCloseOk => ids::CONNECTION_CLOSE_OK,
            Method::ConnectionBlocked { .. } => ids::CONNECTION_BLOCKED,
            Method::ConnectionUnblocked => ids::CONNECTION_UNBLOCKED,
            Method::ChannelOpen => ids::CHANNEL_OPEN,
            Method::ChannelOpenOk => ids::CHANNEL_OPEN_OK,
            Method::ChannelFlow { .. } => ids::CHANNEL_FLOW,
            Method::ChannelFlowOk { .. } => ids::CHANNEL_FLOW_OK,
            Method::ChannelClose(_) => ids::CHANNEL_CLOSE,
            Method::ChannelCloseOk => ids::CHANNEL_CLOSE_OK,
            Method::ExchangeDeclare(_) => ids::EXCHANGE_DECLARE,
            Method::ExchangeDeclareOk => ids::EXCHANGE_DECLARE_OK,
            Method::ExchangeDelete { .. } => ids::EXCHANGE_DELETE,
            Method::ExchangeDeleteOk => ids::EXCHANGE_DELETE_OK,
            Method::ExchangeBind(_) => ids::EXCHANGE_BIND,
            Method::ExchangeBindOk => ids::EXCHANGE_BIND_OK,
            Method::ExchangeUnbind(_) => ids::EXCHANGE_UNBIND,
            Method::ExchangeUnbindOk => ids::EXCHANGE_UNBIND_OK,
            Method::QueueDeclare(_) => ids::QUEUE_DECLARE,
            Method::QueueDeclareOk(_) => ids::QUEUE_DECLARE_OK,
            Method::QueueBind(_) => ids::QUEUE_BIND,
            Method::QueueBindOk => ids::QUEUE_BIND_OK,
            Method::QueuePurge { .. } => ids::QUEUE_PURGE,
            Method::QueuePurgeOk { .. } => ids::QUEUE_PURGE_OK,
            Method::QueueDelete { .. } => ids::QUEUE_DELETE,
            Method::QueueDeleteOk { .. } => ids::QUEUE_DELETE_OK,
            Method::QueueUnbind(_) => ids::QUEUE_UNBIND,
            Method::QueueUnbindOk => ids::QUEUE_UNBIND_OK,
            Method::BasicQos(_) => ids::BASIC_QOS,
            Method::BasicQosOk => ids::BASIC_QOS_OK,
            Method::BasicConsume(_) => ids::BASIC_CONSUME,
            Method::BasicConsumeOk { .. } => ids::BASIC_CONSUME_OK,
            Method::BasicCancel { .. } => ids::BASIC_CANCEL,
            Method::BasicCancelOk { .. } => ids::BASIC_CANCEL_OK,
            Method::BasicPublish(_) => ids::BASIC_PUBLISH,
            Method::BasicReturn(_) => ids::BASIC_RETURN,
            Method::BasicDeliver(_) => ids::BASIC_DELIVER,
            Method::BasicGet { .. } => ids::BASIC_GET,
            Method::BasicGetOk(_) => ids::BASIC_GET_OK,
            Method::BasicGetEmpty => ids::BASIC_GET_EMPTY,
            Method::BasicAck { .. } => ids::BASIC_ACK,
            Method::BasicReject { .. } => ids::BASIC_REJECT,
            Method::BasicNack { .. } => ids::BASIC_NACK,
            Method::ConfirmSelect => ids::CONFIRM_SELECT,
            Method::ConfirmSelectOk => ids::CONFIRM_SELECT_OK,
            Method::Other { id, .. } => *id,
        }
    }

    /// Whether a content header and body frames follow this method.
    pub fn carries_content(&self) -> bool {
        matches!(
            self,
            Method::BasicPublish(_)
                | Method::BasicReturn(_)
                | Method::BasicDeliver(_)
                | Method::BasicGetOk(_)
        )
    }

    /// Decode a method frame payload.
    pub fn decode(payload: Bytes) -> Result<Method> {
        let mut d = Decoder::new(payload);
        let id = MethodId::new(d.u16()?, d.u16()?);

        let method = match id {
            ids::CONNECTION_START => Method::ConnectionStart(ConnectionStart {
                version_major: d.u8()?,
                version_minor: d.u8()?,
                server_properties: d.table()?,
                mechanisms: d.long_str()?,
                locales: d.long_str()?,
            }),
            ids::CONNECTION_START_OK => Method::ConnectionStartOk(ConnectionStartOk {
                client_properties: d.table()?,
                mechanism: d.short_str()?,
                response: d.long_bytes()?,
                locale: d.short_str()?,
            }),
            ids::CONNECTION_TUNE => Method::ConnectionTune(decode_tune(&mut d)?),
            ids::CONNECTION_TUNE_OK => Method::ConnectionTuneOk(decode_tune(&mut d)?),
            ids::CONNECTION_OPEN => {
                let virtual_host = d.short_str()?;
                let _capabilities = d.short_str()?;
                let _insist = d.bits::<1>()?;
                Method::ConnectionOpen { virtual_host }
            }
            ids::CONNECTION_OPEN_OK => {
                let _known_hosts = d.short_str()?;
                Method::ConnectionOpenOk
            }
            ids::CONNECTION_CLOSE => Method::ConnectionClose(decode_close(&mut d)?),
            ids::CONNECTION_CLOSE_OK => Method::ConnectionCloseOk,
            ids::CONNECTION_BLOCKED => Method::ConnectionBlocked {
                reason: d.short_str()?,
            },
            ids::CONNECTION_UNBLOCKED => Method::ConnectionUnblocked,

            ids::CHANNEL_OPEN => {
                let _out_of_band = d.short_str()?;
                Method::ChannelOpen
            }
            ids::CHANNEL_OPEN_OK => {
                let _channel_id = d.long_bytes()?;
                Method::ChannelOpenOk
            }
            ids::CHANNEL_FLOW => Method::ChannelFlow {
                active: d.bits::<1>()?[0],
            },
            ids::CHANNEL_FLOW_OK => Method::ChannelFlowOk {
                active: d.bits::<1>()?[0],
            },
            ids::CHANNEL_CLOSE => Method::ChannelClose(decode_close(&mut d)?),
            ids::CHANNEL_CLOSE_OK => Method::ChannelCloseOk,

            ids::EXCHANGE_DECLARE => {
                let _ticket = d.u16()?;
                let exchange = d.short_str()?;
                let kind = d.short_str()?;
                let [passive, durable, auto_delete, internal, _no_wait] = d.bits::<5>()?;
                Method::ExchangeDeclare(ExchangeDeclare {
                    exchange,
                    kind,
                    passive,
                    durable,
                    auto_delete,
                    internal,
                    arguments: d.table()?,
                })
            }
            ids::EXCHANGE_DECLARE_OK => Method::ExchangeDeclareOk,
            ids::EXCHANGE_DELETE => {
                let _ticket = d.u16()?;
                let exchange = d.short_str()?;
                let [if_unused, _no_wait] = d.bits::<2>()?;
                Method::ExchangeDelete {
                    exchange,
                    if_unused,
                }
            }
            ids::EXCHANGE_DELETE_OK => Method::ExchangeDeleteOk,
            ids::EXCHANGE_BIND => Method::ExchangeBind(decode_exchange_bind(&mut d)?),
            ids::EXCHANGE_BIND_OK => Method::ExchangeBindOk,
            ids::EXCHANGE_UNBIND => Method::ExchangeUnbind(decode_exchange_bind(&mut d)?),
            ids::EXCHANGE_UNBIND_OK => Method::ExchangeUnbindOk,

            ids::QUEUE_DECLARE => {
                let _ticket = d.u16()?;
                let queue = d.short_str()?;
                let [passive, durable, exclusive, auto_delete, _no_wait] = d.bits::<5>()?;
                Method::QueueDeclare(QueueDeclare {
                    queue,
                    passive,
                    durable,
                    exclusive,
                    auto_delete,
                    arguments: d.table()?,
                })
            }
            ids::QUEUE_DECLARE_OK => Method::QueueDeclareOk(QueueDeclareOk {
                queue: d.short_str()?,
                message_count: d.u32()?,
                consumer_count: d.u32()?,
            }),
            ids::QUEUE_BIND => {
                let _ticket = d.u16()?;
                let queue = d.short_str()?;
                let exchange = d.short_str()?;
                let routing_key = d.short_str()?;
                let _no_wait = d.bits::<1>()?;
                Method::QueueBind(QueueBind {
                    queue,
                    exchange,
                    routing_key,
                    arguments: d.table()?,
                })
            }
            ids::QUEUE_BIND_OK => Method::QueueBindOk,
            ids::QUEUE_PURGE => {
                let _ticket = d.u16()?;
                let queue = d.short_str()?;
                let _no_wait = d.bits::<1>()?;
                Method::QueuePurge { queue }
            }
            ids::QUEUE_PURGE_OK => Method::QueuePurgeOk {
                message_count: d.u32()?,
            },
            ids::QUEUE_DELETE => {
                let _ticket = d.u16()?;
                let queue = d.short_str()?;
                let [if_unused, if_empty, _no_wait] = d.bits::<3>()?;
                Method::QueueDelete {
                    queue,
                    if_unused,
                    if_empty,
                }
            }
            ids::QUEUE_DELETE_OK => Method::QueueDeleteOk {
                message_count: d.u32()?,
            },
            ids::QUEUE_UNBIND => {
                let _ticket = d.u16()?;
                Method::QueueUnbind(QueueBind {
                    queue: d.short_str()?,
                    exchange: d.short_str()?,
                    routing_key: d.short_str()?,
                    arguments: d.table()?,
                })
            }
            ids::QUEUE_UNBIND_OK => Method::QueueUnbindOk,

            ids::BASIC_QOS => Method::BasicQos(BasicQos {
                prefetch_size: d.u32()?,
                prefetch_count: d.u16()?,
                global: d.bits::<1>()?[0],
            }),
            ids::BASIC_QOS_OK => Method::BasicQosOk,
            ids::BASIC_CONSUME => {
                let _ticket = d.u16()?;
                let queue = d.short_str()?;
                let consumer_tag = d.short_str()?;
                let [no_local, no_ack, exclusive, _no_wait] = d.bits::<4>()?;
                Method::BasicConsume(BasicConsume {
                    queue,
                    consumer_tag,
                    no_local,
                    no_ack,
                    exclusive,
                    arguments: d.table()?,
                })
            }
            ids::BASIC_CONSUME_OK => Method::BasicConsumeOk {
                consumer_tag: d.short_str()?,
            },
            ids::BASIC_CANCEL => Method::BasicCancel {
                consumer_tag: d.short_str()?,
                no_wait: d.bits::<1>()?[0],
            },
            ids::BASIC_CANCEL_OK => Method::BasicCancelOk {
                consumer_tag: d.short_str()?,
            },
            ids::BASIC_PUBLISH => {
                let _ticket = d.u16()?;
                let exchange = d.short_str()?;
                let routing_key = d.short_str()?;
                let [mandatory, immediate] = d.bits::<2>()?;
                Method::BasicPublish(BasicPublish {
                    exchange,
                    routing_key,
                    mandatory,
                    immediate,
                })
            }
            ids::BASIC_RETURN => Method::BasicReturn(BasicReturn {
                reply_code: d.u16()?,
                reply_text: d.short_str()?,
                exchange: d.short_str()?,
                routing_key: d.short_str()?,
            }),
            ids::BASIC_DELIVER => Method::BasicDeliver(BasicDeliver {
                consumer_tag: d.short_str()?,
                delivery_tag: d.u64()?,
                redelivered: d.bits::<1>()?[0],
                exchange: d.short_str()?,
                routing_key: d.short_str()?,
            }),
            ids::BASIC_GET => {
                let _ticket = d.u16()?;
                Method::BasicGet {
                    queue: d.short_str()?,
                    no_ack: d.bits::<1>()?[0],
                }
            }
            ids::BASIC_GET_OK => Method::BasicGetOk(BasicGetOk {
                delivery_tag: d.u64()?,
                redelivered: d.bits::<1>()?[0],
                exchange: d.short_str()?,
                routing_key: d.short_str()?,
                message_count: d.u32()?,
            }),
            ids::BASIC_GET_EMPTY => {
                let _cluster_id = d.short_str()?;
                Method::BasicGetEmpty
            }
            ids::BASIC_ACK => Method::BasicAck {
                delivery_tag: d.u64()?,
                multiple: d.bits::<1>()?[0],
            },
            ids::BASIC_REJECT => Method::BasicReject {
                delivery_tag: d.u64()?,
                requeue: d.bits::<1>()?[0],
            },
            ids::BASIC_NACK => {
                let delivery_tag = d.u64()?;
                let [multiple, requeue] = d.bits::<2>()?;
                Method::BasicNack {
                    delivery_tag,
                    multiple,
                    requeue,
                }
            }

            ids::CONFIRM_SELECT => {
                let _no_wait = d.bits::<1>()?;
                Method::ConfirmSelect
            }
            ids::CONFIRM_SELECT_OK => Method::ConfirmSelectOk,

            id => {
                let rest = d.remaining();
                Method::Other {
                    id,
                    arguments: d.bytes(rest)?,
                }
            }
        };

        Ok(method)
    }

    /// Append the method payload (ids and arguments) to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let id = self.id();
        buf.put_u16(id.class_id);
        buf.put_u16(id.method_id);

        match self {
            Method::ConnectionStart(m) => {
                buf.put_u8(m.version_major);
                buf.put_u8(m.version_minor);
                buf.put_table(&m.server_properties)?;
                buf.put_long_str(m.mechanisms.as_bytes());
                buf.put_long_str(m.locales.as_bytes());
            }
            Method::ConnectionStartOk(m) => {
                buf.put_table(&m.client_properties)?;
                buf.put_short_str(&m.mechanism)?;
                buf.put_long_str(&m.response);
                buf.put_short_str(&m.locale)?;
            }
            Method::ConnectionTune(t) | Method::ConnectionTuneOk(t) => {
                buf.put_u16(t.channel_max);
                buf.put_u32(t.frame_max);
                buf.put_u16(t.heartbeat);
            }
            Method::ConnectionOpen { virtual_host } => {
                buf.put_short_str(virtual_host)?;
                buf.put_short_str("")?;
                buf.put_bits(&[false]);
            }
            Method::ConnectionOpenOk => buf.put_short_str("")?,
            Method::ConnectionClose(c) | Method::ChannelClose(c) => {
                buf.put_u16(c.reply_code);
                buf.put_short_str(&c.reply_text)?;
                buf.put_u16(c.class_id);
                buf.put_u16(c.method_id);
            }
            Method::ConnectionBlocked { reason } => buf.put_short_str(reason)?,

            Method::ChannelOpen => buf.put_short_str("")?,
            Method::ChannelOpenOk => buf.put_long_str(b""),
            Method::ChannelFlow { active } | Method::ChannelFlowOk { active } => {
                buf.put_bits(&[*active])
            }

            Method::ExchangeDeclare(m) => {
                buf.put_u16(0);
                buf.put_short_str(&m.exchange)?;
                buf.put_short_str(&m.kind)?;
                buf.put_bits(&[m.passive, m.durable, m.auto_delete, m.internal, false]);
                buf.put_table(&m.arguments)?;
            }
            Method::ExchangeDelete {
                exchange,
                if_unused,
            } => {
                buf.put_u16(0);
                buf.put_short_str(exchange)?;
                buf.put_bits(&[*if_unused, false]);
            }
            Method::ExchangeBind(m) | Method::ExchangeUnbind(m) => {
                buf.put_u16(0);
                buf.put_short_str(&m.destination)?;
                buf.put_short_str(&m.source)?;
                buf.put_short_str(&m.routing_key)?;
                buf.put_bits(&[false]);
                buf.put_table(&m.arguments)?;
            }

            Method::QueueDeclare(m) => {
                buf.put_u16(0);
                buf.put_short_str(&m.queue)?;
                buf.put_bits(&[m.passive, m.durable, m.exclusive, m.auto_delete, false]);
                buf.put_table(&m.arguments)?;
            }
            Method::QueueDeclareOk(m) => {
                buf.put_short_str(&m.queue)?;
                buf.put_u32(m.message_count);
                buf.put_u32(m.consumer_count);
            }
            Method::QueueBind(m) => {
                buf.put_u16(0);
                buf.put_short_str(&m.queue)?;
                buf.put_short_str(&m.exchange)?;
                buf.put_short_str(&m.routing_key)?;
                buf.put_bits(&[false]);
                buf.put_table(&m.arguments)?;
            }
            Method::QueuePurge { queue } => {
                buf.put_u16(0);
                buf.put_short_str(queue)?;
                buf.put_bits(&[false]);
            }
            Method::QueuePurgeOk { message_count } | Method::QueueDeleteOk { message_count } => {
                buf.put_u32(*message_count)
            }
            Method::QueueDelete {
                queue,
                if_unused,
                if_empty,
            } => {
                buf.put_u16(0);
                buf.put_short_str(queue)?;
                buf.put_bits(&[*if_unused, *if_empty, false]);
            }
            Method::QueueUnbind(m) => {
                buf.put_u16(0);
                buf.put_short_str(&m.queue)?;
                buf.put_short_str(&m.exchange)?;
                buf.put_short_str(&m.routing_key)?;
                buf.put_table(&m.arguments)?;
            }

            Method::BasicQos(m) => {
                buf.put_u32(m.prefetch_size);
                buf.put_u16(m.prefetch_count);
                buf.put_bits(&[m.global]);
            }
            Method::BasicConsume(m) => {
                buf.put_u16(0);
                buf.put_short_str(&m.queue)?;
                buf.put_short_str(&m.consumer_tag)?;
                buf.put_bits(&[m.no_local, m.no_ack, m.exclusive, false]);
                buf.put_table(&m.arguments)?;
            }
            Method::BasicConsumeOk { consumer_tag } | Method::BasicCancelOk { consumer_tag } => {
                buf.put_short_str(consumer_tag)?
            }
            Method::BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                buf.put_short_str(consumer_tag)?;
                buf.put_bits(&[*no_wait]);
            }
            Method::BasicPublish(m) => {
                buf.put_u16(0);
                buf.put_short_str(&m.exchange)?;
                buf.put_short_str(&m.routing_key)?;
                buf.put_bits(&[m.mandatory, m.immediate]);
            }
            Method::BasicReturn(m) => {
                buf.put_u16(m.reply_code);
                buf.put_short_str(&m.reply_text)?;
                buf.put_short_str(&m.exchange)?;
                buf.put_short_str(&m.routing_key)?;
            }
            Method::BasicDeliver(m) => {
                buf.put_short_str(&m.consumer_tag)?;
                buf.put_u64(m.delivery_tag);
                buf.put_bits(&[m.redelivered]);
                buf.put_short_str(&m.exchange)?;
                buf.put_short_str(&m.routing_key)?;
            }
            Method::BasicGet { queue, no_ack } => {
                buf.put_u16(0);
                buf.put_short_str(queue)?;
                buf.put_bits(&[*no_ack]);
            }
            Method::BasicGetOk(m) => {
                buf.put_u64(m.delivery_tag);
                buf.put_bits(&[m.redelivered]);
                buf.put_short_str(&m.exchange)?;
                buf.put_short_str(&m.routing_key)?;
                buf.put_u32(m.message_count);
            }
            Method::BasicGetEmpty => buf.put_short_str("")?,
            Method::BasicAck {
                delivery_tag,
                multiple,
            } => {
                buf.put_u64(*delivery_tag);
                buf.put_bits(&[*multiple]);
            }
            Method::BasicReject {
                delivery_tag,
                requeue,
            } => {
                buf.put_u64(*delivery_tag);
                buf.put_bits(&[*requeue]);
            }
            Method::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => {
                buf.put_u64(*delivery_tag);
                buf.put_bits(&[*multiple, *requeue]);
            }

            Method::ConfirmSelect => buf.put_bits(&[false]),

            Method::Other { arguments, .. } => buf.put_slice(arguments),

            Method::ConnectionCloseOk
            | Method::ConnectionUnblocked
            | Method::ChannelCloseOk
            | Method::ExchangeDeclareOk
            | Method::ExchangeDeleteOk
            | Method::ExchangeBindOk
            | Method::ExchangeUnbindOk
            | Method::QueueBindOk
            | Method::QueueUnbindOk
            | Method::BasicQosOk
            | Method::ConfirmSelectOk => {}
        }

        Ok(())
    }

    /// Append a complete method frame for `channel` to `buf`.
    pub fn write_frame(&self, buf: &mut BytesMut, channel: u16) -> Result<()> {
        let mut payload = BytesMut::with_capacity(64);
        self.encode(&mut payload)?;
        write_frame(buf, FrameType::Method, channel, &payload);
        Ok(())
    }

    /// The close reason, for Connection.Close and Channel.Close.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            Method::ConnectionClose(c) | Method::ChannelClose(c) => Some(c),
            _ => None,
        }
    }

    /// Turn a Connection.Close / Channel.Close into the error it represents.
    pub fn close_error(&self) -> Option<TransportError> {
        self.close_reason()
            .map(|c| TransportError::protocol(c.reply_code, c.reply_text.clone()))
    }
}

fn decode_tune(d: &mut Decoder) -> Result<Tune> {
    Ok(Tune {
        channel_max: d.u16()?,
        frame_max: d.u32()?,
        heartbeat: d.u16()?,
    })
}

fn decode_close(d: &mut Decoder) -> Result<CloseReason> {
    Ok(CloseReason {
        reply_code: d.u16()?,
        reply_text: d.short_str()?,
        class_id: d.u16()?,
        method_id: d.u16()?,
    })
}

fn decode_exchange_bind(d: &mut Decoder) -> Result<ExchangeBind> {
    let _ticket = d.u16()?;
    let destination = d.short_str()?;
    let source = d.short_str()?;
    let routing_key = d.short_str()?;
    let _no_wait = d.bits::<1>()?;
    Ok(ExchangeBind {
        destination,
        source,
        routing_key,
        arguments: d.table()?,
    })
}
