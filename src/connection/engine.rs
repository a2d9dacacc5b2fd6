//! Sans-I/O connection engine.
//!
//! [`EngineCore`] owns every piece of mutable connection state: the frame
//! buffer, the write buffer and its flush gate, the await registry, the
//! channel table and heartbeat bookkeeping. The reactor feeds it socket
//! bytes, write completions, timer ticks and [`Command`]s from handles, and
//! ships whatever it puts in the write buffer. Nothing here touches a socket,
//! which keeps the core testable with plain byte slices.
//!
//! Handles talk to the reactor through an [`EngineHandle`]; replies travel
//! back on oneshot channels.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::awaiter::{Await, AwaitKind, AwaitRegistry, Predicate, Reply, Responder};
use super::heartbeat::Heartbeat;
use super::state::{ConnectionState, StateTracker};
use super::writer::FlushGate;
use crate::channel::ChannelState;
use crate::consumer::{Delivery, DeliveryAssembler, Origin};
use crate::error::{Result, TransportError};
use crate::protocol::{
    ContentHeader, Frame, FrameBuffer, FrameType, Method, MethodId, Tune, DEFAULT_CHANNEL_MAX,
};

/// Request from a handle to the reactor.
#[derive(Debug)]
pub(crate) enum Command {
    /// Queue `bytes` for `channel`. The await (if any) is registered before
    /// the bytes are queued; `flushed` resolves once they are on the socket.
    Rpc {
        channel: u16,
        bytes: Bytes,
        awaiting: Option<Await>,
        flushed: Option<oneshot::Sender<Result<()>>>,
    },
    /// Reserve the lowest free channel id.
    AllocateChannel { reply: oneshot::Sender<Result<u16>> },
    /// Forget a channel whose open failed.
    ReleaseChannel { channel: u16 },
    /// Current state of a channel.
    QueryChannel {
        channel: u16,
        reply: oneshot::Sender<ChannelState>,
    },
    /// Negotiated limits from Connection.Tune.
    Tune(Tune),
    /// Handshake finished; `reply` fires once the state is `Connected`.
    Established {
        heartbeat: Option<Duration>,
        reply: oneshot::Sender<()>,
    },
    /// Route deliveries for `tag` to `sink`.
    RegisterConsumer {
        channel: u16,
        tag: String,
        sink: mpsc::UnboundedSender<Delivery>,
    },
    RemoveConsumer { channel: u16, tag: String },
    /// Publish frames. In confirm mode the reply waits for the broker's
    /// Ack/Nack, otherwise for the flush.
    Publish {
        channel: u16,
        bytes: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Start an orderly close. Replies with the open channel ids, or `None`
    /// when a close is already running.
    BeginClose {
        reply: oneshot::Sender<Result<Option<Vec<u16>>>>,
    },
    /// Tear down and exit.
    Shutdown,
}

/// What the reactor should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Directive {
    Continue,
    ArmHeartbeat(Duration),
    DisarmHeartbeat,
    Stop,
}

/// Per-channel state kept by the engine.
#[derive(Debug)]
struct ChannelSlot {
    state: ChannelState,
    consumers: HashMap<String, mpsc::UnboundedSender<Delivery>>,
    assembler: DeliveryAssembler,
    /// Next publish sequence number once confirm mode is on.
    confirm_seq: Option<u64>,
    /// Basic.Get waiting for its content.
    pending_get: Option<Await>,
}

impl ChannelSlot {
    fn new(id: u16) -> Self {
        Self {
            state: ChannelState::Opening,
            consumers: HashMap::new(),
            assembler: DeliveryAssembler::new(id),
            confirm_seq: None,
            pending_get: None,
        }
    }

    fn dispatch(&mut self, origin: Origin, delivery: Delivery) {
        match origin {
            Origin::Deliver => {
                let tag = delivery.consumer_tag.clone().unwrap_or_default();
                let gone = match self.consumers.get(&tag) {
                    Some(sink) => sink.send(delivery).is_err(),
                    None => {
                        tracing::debug!(consumer_tag = %tag, "Delivery for unknown consumer dropped");
                        false
                    }
                };
                if gone {
                    tracing::debug!(consumer_tag = %tag, "Consumer stream dropped");
                    self.consumers.remove(&tag);
                }
            }
            Origin::Get { message_count } => match self.pending_get.take() {
                Some(get) => {
                    tracing::trace!(message_count, "Basic.Get completed");
                    get.resolve(Ok(Reply::Delivery(Some(delivery))));
                }
                None => tracing::debug!("Basic.GetOk without a pending get"),
            },
            Origin::Return {
                reply_code,
                reply_text,
            } => {
                tracing::warn!(
                    channel = delivery.channel,
                    reply_code,
                    reply_text = %reply_text,
                    exchange = %delivery.exchange,
                    routing_key = %delivery.routing_key,
                    "Message returned by broker"
                );
            }
        }
    }
}

/// Connection state machine driven by the reactor.
#[derive(Debug)]
pub(crate) struct EngineCore {
    state: StateTracker,
    frames: FrameBuffer,
    write_buf: BytesMut,
    flush: FlushGate,
    /// A chunk is with the writer task.
    writing: bool,
    awaits: AwaitRegistry,
    channels: BTreeMap<u16, ChannelSlot>,
    channel_max: u16,
    heartbeat: Heartbeat,
}

impl EngineCore {
    pub fn new(state: StateTracker) -> Self {
        Self {
            state,
            frames: FrameBuffer::new(),
            write_buf: BytesMut::with_capacity(8 * 1024),
            flush: FlushGate::new(),
            writing: false,
            awaits: AwaitRegistry::new(),
            channels: BTreeMap::new(),
            channel_max: DEFAULT_CHANNEL_MAX,
            heartbeat: Heartbeat::new(),
        }
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    #[cfg(test)]
    pub fn flush_cycles(&self) -> u64 {
        self.flush.cycles()
    }

    /// Apply a handle command.
    pub fn handle_command(&mut self, command: Command, now: Instant) -> Directive {
        match command {
            Command::Rpc {
                channel,
                bytes,
                awaiting,
                flushed,
            } => {
                if channel != 0 && !self.channels.contains_key(&channel) {
                    let err = TransportError::ChannelClosed(channel);
                    if let Some(a) = awaiting {
                        a.resolve(Err(err.clone()));
                    }
                    if let Some(tx) = flushed {
                        let _ = tx.send(Err(err));
                    }
                    return Directive::Continue;
                }
                if let Some(a) = awaiting {
                    if a.kind == AwaitKind::ChannelClose {
                        if let Some(slot) = self.channels.get_mut(&channel) {
                            slot.state = ChannelState::Closing;
                        }
                    }
                    self.awaits.register(a);
                }
                self.write_buf.extend_from_slice(&bytes);
                if let Some(tx) = flushed {
                    self.flush.wait(tx);
                }
            }
            Command::AllocateChannel { reply } => {
                let _ = reply.send(self.allocate_channel());
            }
            Command::ReleaseChannel { channel } => {
                self.remove_channel(channel, &TransportError::ChannelClosed(channel));
            }
            Command::QueryChannel { channel, reply } => {
                let state = self
                    .channels
                    .get(&channel)
                    .map_or(ChannelState::Closed, |slot| slot.state);
                let _ = reply.send(state);
            }
            Command::Tune(tune) => {
                self.channel_max = tune.channel_max;
                self.frames.set_frame_max(tune.frame_max);
            }
            Command::Established { heartbeat, reply } => {
                self.state.transition(ConnectionState::Connected);
                let _ = reply.send(());
                if let Some(interval) = heartbeat {
                    self.heartbeat.arm(interval, now);
                    return Directive::ArmHeartbeat(interval);
                }
            }
            Command::RegisterConsumer { channel, tag, sink } => {
                if let Some(slot) = self.channels.get_mut(&channel) {
                    slot.consumers.insert(tag, sink);
                }
            }
            Command::RemoveConsumer { channel, tag } => {
                if let Some(slot) = self.channels.get_mut(&channel) {
                    slot.consumers.remove(&tag);
                }
            }
            Command::Publish {
                channel,
                bytes,
                reply,
            } => {
                let Some(slot) = self.channels.get_mut(&channel) else {
                    let _ = reply.send(Err(TransportError::ChannelClosed(channel)));
                    return Directive::Continue;
                };
                match slot.confirm_seq {
                    Some(seq) => {
                        slot.confirm_seq = Some(seq + 1);
                        self.awaits.register(Await::new(
                            channel,
                            Predicate::Confirm { delivery_tag: seq },
                            AwaitKind::Reply,
                            Responder::Done(reply),
                        ));
                    }
                    None => self.flush.wait(reply),
                }
                self.write_buf.extend_from_slice(&bytes);
            }
            Command::BeginClose { reply } => match self.state.get() {
                ConnectionState::Disconnecting => {
                    let _ = reply.send(Ok(None));
                }
                ConnectionState::Connected => {
                    self.state.transition(ConnectionState::Disconnecting);
                    self.heartbeat.disarm();
                    let open = self.channels.keys().copied().collect();
                    let _ = reply.send(Ok(Some(open)));
                    return Directive::DisarmHeartbeat;
                }
                _ => {
                    let _ = reply.send(Err(TransportError::NotConnected));
                }
            },
            Command::Shutdown => return Directive::Stop,
        }
        Directive::Continue
    }

    fn allocate_channel(&mut self) -> Result<u16> {
        if self.state.get() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let id = (1..=self.channel_max)
            .find(|id| !self.channels.contains_key(id))
            .ok_or(TransportError::ChannelsExhausted(self.channel_max))?;
        self.channels.insert(id, ChannelSlot::new(id));
        Ok(id)
    }

    fn remove_channel(&mut self, channel: u16, err: &TransportError) {
        if let Some(slot) = self.channels.remove(&channel) {
            if let Some(get) = slot.pending_get {
                get.resolve(Err(err.clone()));
            }
        }
        self.awaits.fail_channel(channel, err);
    }

    /// Bytes read from the socket.
    ///
    /// An error is fatal for the connection.
    pub fn on_data(&mut self, data: &[u8], now: Instant) -> Result<()> {
        self.heartbeat.record_read(now);
        for frame in self.frames.push(data)? {
            self.on_frame(frame)?;
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame) -> Result<()> {
        let channel = frame.channel();
        match frame.frame_type() {
            FrameType::Heartbeat => {
                tracing::trace!("Heartbeat received");
                Ok(())
            }
            FrameType::Method => {
                let method = Method::decode(frame.payload)?;
                tracing::trace!(channel, method = %method.id(), "Method received");
                self.on_method(channel, method)
            }
            FrameType::Header => {
                let header = ContentHeader::decode(frame.payload)?;
                let slot = self
                    .channels
                    .get_mut(&channel)
                    .ok_or(TransportError::UnknownChannel(channel))?;
                match slot.assembler.header(header) {
                    Ok(Some((origin, delivery))) => slot.dispatch(origin, delivery),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(channel, error = %e, "Discarding content header"),
                }
                Ok(())
            }
            FrameType::Body => {
                let slot = self
                    .channels
                    .get_mut(&channel)
                    .ok_or(TransportError::UnknownChannel(channel))?;
                match slot.assembler.body(frame.payload) {
                    Ok(Some((origin, delivery))) => slot.dispatch(origin, delivery),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(channel, error = %e, "Discarding body frame"),
                }
                Ok(())
            }
        }
    }

    fn on_method(&mut self, channel: u16, method: Method) -> Result<()> {
        if let Method::ConnectionClose(reason) = &method {
            tracing::warn!(
                code = reason.reply_code,
                text = %reason.reply_text,
                "Broker closed the connection"
            );
            Method::ConnectionCloseOk.write_frame(&mut self.write_buf, 0)?;
            return Err(TransportError::protocol(reason.reply_code, reason.reply_text.clone()));
        }

        if channel != 0 {
            if let Method::ChannelClose(reason) = &method {
                if !self.channels.contains_key(&channel) {
                    return Err(TransportError::UnknownChannel(channel));
                }
                tracing::warn!(
                    channel,
                    code = reason.reply_code,
                    text = %reason.reply_text,
                    "Broker closed the channel"
                );
                let err = TransportError::protocol(reason.reply_code, reason.reply_text.clone());
                self.remove_channel(channel, &err);
                Method::ChannelCloseOk.write_frame(&mut self.write_buf, channel)?;
                return Ok(());
            }

            if matches!(method, Method::BasicAck { .. } | Method::BasicNack { .. }) {
                let confirms = self.awaits.take_confirms(channel, &method);
                if !confirms.is_empty() {
                    self.resolve_confirms(confirms, &method);
                    return Ok(());
                }
            }
        }

        if let Some(awaiting) = self.awaits.take_match(channel, &method) {
            self.complete(awaiting, channel, method);
            return Ok(());
        }

        if channel == 0 {
            match method {
                Method::ConnectionBlocked { reason } => {
                    tracing::warn!(reason = %reason, "Broker blocked the connection")
                }
                Method::ConnectionUnblocked => tracing::info!("Broker unblocked the connection"),
                other => tracing::debug!(method = %other.id(), "Ignoring unexpected connection method"),
            }
            return Ok(());
        }

        let slot = self
            .channels
            .get_mut(&channel)
            .ok_or(TransportError::UnknownChannel(channel))?;

        match method {
            m if m.carries_content() => {
                if let Err(e) = slot.assembler.begin(m) {
                    tracing::warn!(channel, error = %e, "Discarding content method");
                }
            }
            Method::ChannelFlow { active } => {
                tracing::info!(channel, active, "Broker changed channel flow");
                Method::ChannelFlowOk { active }.write_frame(&mut self.write_buf, channel)?;
            }
            Method::BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                tracing::info!(channel, consumer_tag = %consumer_tag, "Broker cancelled consumer");
                slot.consumers.remove(&consumer_tag);
                if !no_wait {
                    Method::BasicCancelOk { consumer_tag }.write_frame(&mut self.write_buf, channel)?;
                }
            }
            other => {
                tracing::warn!(channel, method = %other.id(), "Unexpected method");
            }
        }
        Ok(())
    }

    fn resolve_confirms(&mut self, confirms: Vec<Await>, method: &Method) {
        let nack = matches!(method, Method::BasicNack { .. });
        for confirm in confirms {
            if nack {
                let tag = match confirm.predicate {
                    Predicate::Confirm { delivery_tag } => delivery_tag,
                    Predicate::Methods(_) => 0,
                };
                confirm.resolve(Err(TransportError::PublishRejected(tag)));
            } else {
                confirm.resolve(Ok(Reply::Method(method.clone())));
            }
        }
    }

    /// Apply the side effect of a matched await and resolve it.
    fn complete(&mut self, awaiting: Await, channel: u16, method: Method) {
        match awaiting.kind.clone() {
            AwaitKind::Reply => {}
            AwaitKind::ChannelOpen => {
                if let Some(slot) = self.channels.get_mut(&channel) {
                    slot.state = ChannelState::Open;
                }
            }
            AwaitKind::ChannelClose => {
                awaiting.resolve(Ok(Reply::Method(method)));
                self.remove_channel(channel, &TransportError::ChannelClosed(channel));
                return;
            }
            AwaitKind::ConfirmSelect => {
                if let Some(slot) = self.channels.get_mut(&channel) {
                    slot.confirm_seq.get_or_insert(1);
                }
            }
            AwaitKind::Cancel(tag) => {
                if let Some(slot) = self.channels.get_mut(&channel) {
                    slot.consumers.remove(&tag);
                }
            }
            AwaitKind::Get => match (method, self.channels.get_mut(&channel)) {
                (Method::BasicGetEmpty, _) => {
                    awaiting.resolve(Ok(Reply::Delivery(None)));
                    return;
                }
                (method @ Method::BasicGetOk(_), Some(slot)) => {
                    if let Err(e) = slot.assembler.begin(method) {
                        awaiting.resolve(Err(e));
                    } else {
                        slot.pending_get = Some(awaiting);
                    }
                    return;
                }
                (method, _) => {
                    awaiting.resolve(Ok(Reply::Method(method)));
                    return;
                }
            },
        }
        awaiting.resolve(Ok(Reply::Method(method)));
    }

    /// Heartbeat timer fired.
    ///
    /// An error (the broker went silent) is fatal for the connection.
    pub fn on_heartbeat_tick(&mut self, now: Instant) -> Result<()> {
        if let Some(silence) = self.heartbeat.peer_silent(now) {
            tracing::warn!(?silence, "Broker missed heartbeats");
            return Err(TransportError::Timeout(silence));
        }
        if self.heartbeat.due(now) {
            tracing::trace!("Sending heartbeat");
            Frame::heartbeat().encode_into(&mut self.write_buf);
        }
        Ok(())
    }

    /// Next chunk for the writer task, if one should go out now.
    ///
    /// When nothing is buffered and nothing is being written, the current
    /// flush cycle ends and its waiters are resolved.
    pub fn poll_flush(&mut self) -> Option<Bytes> {
        if self.writing {
            return None;
        }
        if self.write_buf.is_empty() {
            if self.flush.in_flight() || self.flush.has_waiters() {
                self.flush.complete();
            }
            return None;
        }
        self.flush.start();
        self.writing = true;
        Some(self.write_buf.split().freeze())
    }

    /// The writer task finished a chunk.
    ///
    /// An error is fatal for the connection.
    pub fn on_written(&mut self, result: std::io::Result<()>, now: Instant) -> Result<()> {
        self.writing = false;
        match result {
            Ok(()) => {
                self.heartbeat.record_write(now);
                Ok(())
            }
            Err(e) => {
                let err = TransportError::from(e);
                self.flush.fail(&err);
                Err(err)
            }
        }
    }

    /// Whatever is still buffered, for a best-effort final write.
    pub fn take_pending(&mut self) -> Option<Bytes> {
        (!self.write_buf.is_empty()).then(|| self.write_buf.split().freeze())
    }

    /// Fail everything outstanding and return to `NotConnected`.
    pub fn teardown(&mut self, err: &TransportError) {
        self.awaits.fail_all(err);
        for (_, slot) in std::mem::take(&mut self.channels) {
            if let Some(get) = slot.pending_get {
                get.resolve(Err(err.clone()));
            }
        }
        self.flush.fail(err);
        self.frames.clear();
        self.write_buf.clear();
        self.writing = false;
        self.heartbeat.reset();
        self.channel_max = DEFAULT_CHANNEL_MAX;
        self.state.transition(ConnectionState::NotConnected);
    }
}

/// Cloneable handle for sending commands to the reactor.
#[derive(Debug, Clone)]
pub(crate) struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    pub fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    /// Fire-and-forget.
    pub fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send a command carrying a reply channel and wait for the answer.
    pub async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send `bytes` and wait for one of `expect` on `channel`.
    pub async fn request_reply(
        &self,
        channel: u16,
        bytes: Bytes,
        expect: &[MethodId],
        kind: AwaitKind,
    ) -> Result<Reply> {
        let (awaiting, rx) = Await::methods(channel, expect, kind);
        self.send(Command::Rpc {
            channel,
            bytes,
            awaiting: Some(awaiting),
            flushed: None,
        })?;
        rx.await.map_err(|_| TransportError::ConnectionClosed)?
    }

    /// Like [`request_reply`](Self::request_reply), expecting a method back.
    pub async fn request(
        &self,
        channel: u16,
        bytes: Bytes,
        expect: &[MethodId],
        kind: AwaitKind,
    ) -> Result<Method> {
        match self.request_reply(channel, bytes, expect, kind).await? {
            Reply::Method(method) => Ok(method),
            Reply::Delivery(_) => Err(TransportError::ProtocolViolation(
                "Expected a method reply".to_string(),
            )),
        }
    }

    /// Send `bytes` and wait until they are flushed to the socket.
    pub async fn write(&self, channel: u16, bytes: Bytes) -> Result<()> {
        self.call(|tx| Command::Rpc {
            channel,
            bytes,
            awaiting: None,
            flushed: Some(tx),
        })
        .await?
    }
}

/// Encode one method frame.
pub(crate) fn method_frame(channel: u16, method: &Method) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    method.write_frame(&mut buf, channel)?;
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ids, BasicDeliver, BasicProperties, CloseReason};

    fn established(heartbeat: Option<Duration>) -> Command {
        let (reply, _) = oneshot::channel();
        Command::Established { heartbeat, reply }
    }

    fn connected_core() -> (EngineCore, StateTracker) {
        let state = StateTracker::new();
        state.transition(ConnectionState::Connecting);
        let mut core = EngineCore::new(state.clone());
        core.handle_command(established(None), Instant::now());
        (core, state)
    }

    #[test]
    fn test_established_acknowledged_after_connected() {
        let state = StateTracker::new();
        state.transition(ConnectionState::Connecting);
        let mut core = EngineCore::new(state.clone());

        let (reply, mut rx) = oneshot::channel();
        core.handle_command(Command::Established { heartbeat: None, reply }, Instant::now());

        assert!(rx.try_recv().is_ok());
        assert_eq!(state.get(), ConnectionState::Connected);
    }

    fn open_channel(core: &mut EngineCore) -> u16 {
        let (tx, mut rx) = oneshot::channel();
        core.handle_command(Command::AllocateChannel { reply: tx }, Instant::now());
        rx.try_recv().unwrap().unwrap()
    }

    fn inbound(core: &mut EngineCore, channel: u16, method: Method) -> Result<()> {
        let bytes = method_frame(channel, &method).unwrap();
        core.on_data(&bytes, Instant::now())
    }

    fn rpc(core: &mut EngineCore, channel: u16, expect: MethodId, kind: AwaitKind) -> oneshot::Receiver<Result<Reply>> {
        let (awaiting, rx) = Await::methods(channel, &[expect], kind);
        core.handle_command(
            Command::Rpc {
                channel,
                bytes: Bytes::from_static(b"request"),
                awaiting: Some(awaiting),
                flushed: None,
            },
            Instant::now(),
        );
        rx
    }

    fn decode_written(chunk: &[u8]) -> Vec<(u16, Method)> {
        let mut frames = FrameBuffer::new();
        frames
            .push(chunk)
            .unwrap()
            .into_iter()
            .map(|f| (f.channel(), Method::decode(f.payload).unwrap()))
            .collect()
    }

    #[test]
    fn test_allocates_lowest_free_id() {
        let (mut core, _) = connected_core();
        assert_eq!(open_channel(&mut core), 1);
        assert_eq!(open_channel(&mut core), 2);

        core.handle_command(Command::ReleaseChannel { channel: 1 }, Instant::now());
        assert_eq!(open_channel(&mut core), 1);
    }

    #[test]
    fn test_channel_exhaustion() {
        let (mut core, _) = connected_core();
        core.handle_command(
            Command::Tune(Tune {
                channel_max: 1,
                frame_max: 4096,
                heartbeat: 0,
            }),
            Instant::now(),
        );
        open_channel(&mut core);

        let (tx, mut rx) = oneshot::channel();
        core.handle_command(Command::AllocateChannel { reply: tx }, Instant::now());
        assert!(matches!(rx.try_recv().unwrap(), Err(TransportError::ChannelsExhausted(1))));
    }

    #[test]
    fn test_allocation_requires_connected() {
        let mut core = EngineCore::new(StateTracker::new());
        let (tx, mut rx) = oneshot::channel();
        core.handle_command(Command::AllocateChannel { reply: tx }, Instant::now());
        assert!(matches!(rx.try_recv().unwrap(), Err(TransportError::NotConnected)));
    }

    #[test]
    fn test_channel_open_ok_marks_open() {
        let (mut core, _) = connected_core();
        let id = open_channel(&mut core);
        let mut rx = rpc(&mut core, id, ids::CHANNEL_OPEN_OK, AwaitKind::ChannelOpen);

        inbound(&mut core, id, Method::ChannelOpenOk).unwrap();

        assert!(matches!(rx.try_recv(), Ok(Ok(Reply::Method(Method::ChannelOpenOk)))));
        let (tx, mut state) = oneshot::channel();
        core.handle_command(Command::QueryChannel { channel: id, reply: tx }, Instant::now());
        assert_eq!(state.try_recv().unwrap(), ChannelState::Open);
    }

    #[test]
    fn test_unknown_channel_is_fatal() {
        let (mut core, _) = connected_core();
        let deliver = Method::BasicDeliver(BasicDeliver {
            consumer_tag: "c".into(),
            delivery_tag: 1,
            ..Default::default()
        });

        let err = inbound(&mut core, 9, deliver).unwrap_err();
        assert!(matches!(err, TransportError::UnknownChannel(9)));
    }

    #[test]
    fn test_flush_cycle_coalesces_waiters() {
        let (mut core, _) = connected_core();
        let id = open_channel(&mut core);
        let now = Instant::now();

        let (tx1, mut rx1) = oneshot::channel();
        core.handle_command(
            Command::Rpc {
                channel: id,
                bytes: Bytes::from_static(b"one"),
                awaiting: None,
                flushed: Some(tx1),
            },
            now,
        );
        let first = core.poll_flush().unwrap();
        assert_eq!(&first[..], b"one");

        // Queued while the first chunk is being written.
        let (tx2, mut rx2) = oneshot::channel();
        core.handle_command(
            Command::Rpc {
                channel: id,
                bytes: Bytes::from_static(b"two"),
                awaiting: None,
                flushed: Some(tx2),
            },
            now,
        );
        assert!(core.poll_flush().is_none());

        core.on_written(Ok(()), now).unwrap();
        let second = core.poll_flush().unwrap();
        assert_eq!(&second[..], b"two");
        assert!(rx1.try_recv().is_err());

        core.on_written(Ok(()), now).unwrap();
        assert!(core.poll_flush().is_none());

        assert!(matches!(rx1.try_recv(), Ok(Ok(()))));
        assert!(matches!(rx2.try_recv(), Ok(Ok(()))));
        assert_eq!(core.flush_cycles(), 1);
    }

    #[test]
    fn test_write_failure_fails_flush_waiters() {
        let (mut core, _) = connected_core();
        let (tx, mut rx) = oneshot::channel();
        core.handle_command(
            Command::Rpc {
                channel: 0,
                bytes: Bytes::from_static(b"x"),
                awaiting: None,
                flushed: Some(tx),
            },
            Instant::now(),
        );
        core.poll_flush().unwrap();

        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(core.on_written(Err(broken), Instant::now()).is_err());
        assert!(matches!(rx.try_recv(), Ok(Err(TransportError::Io(_)))));
    }

    #[test]
    fn test_heartbeat_suppressed_by_recent_write() {
        let (mut core, _) = connected_core();
        let start = Instant::now();
        let interval = Duration::from_secs(10);
        core.handle_command(established(Some(interval)), start);

        core.handle_command(
            Command::Rpc {
                channel: 0,
                bytes: Bytes::from_static(b"x"),
                awaiting: None,
                flushed: None,
            },
            start,
        );
        core.poll_flush().unwrap();
        core.on_written(Ok(()), start + Duration::from_secs(5)).unwrap();
        core.on_data(&Frame::heartbeat().to_bytes(), start + Duration::from_secs(9)).unwrap();

        core.on_heartbeat_tick(start + Duration::from_secs(10)).unwrap();
        assert!(core.poll_flush().is_none());

        core.on_heartbeat_tick(start + Duration::from_secs(15)).unwrap();
        let chunk = core.poll_flush().unwrap();
        assert_eq!(chunk, Frame::heartbeat().to_bytes());
    }

    #[test]
    fn test_silent_broker_times_out() {
        let (mut core, _) = connected_core();
        let start = Instant::now();
        core.handle_command(established(Some(Duration::from_secs(1))), start);

        assert!(core.on_heartbeat_tick(start + Duration::from_secs(1)).is_ok());
        let err = core.on_heartbeat_tick(start + Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[test]
    fn test_channel_close_fails_only_that_channel() {
        let (mut core, _) = connected_core();
        let one = open_channel(&mut core);
        let two = open_channel(&mut core);
        let mut rx1 = rpc(&mut core, one, ids::QUEUE_DECLARE_OK, AwaitKind::Reply);
        let mut rx2 = rpc(&mut core, two, ids::QUEUE_DECLARE_OK, AwaitKind::Reply);
        core.poll_flush();
        core.on_written(Ok(()), Instant::now()).unwrap();

        inbound(
            &mut core,
            one,
            Method::ChannelClose(CloseReason::new(404, "NOT_FOUND - no queue 'x'")),
        )
        .unwrap();

        match rx1.try_recv() {
            Ok(Err(err)) => assert_eq!(err.reply_code(), Some(404)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx2.try_recv().is_err());

        let written = decode_written(&core.poll_flush().unwrap());
        assert_eq!(written, vec![(one, Method::ChannelCloseOk)]);

        let (tx, mut state) = oneshot::channel();
        core.handle_command(Command::QueryChannel { channel: one, reply: tx }, Instant::now());
        assert_eq!(state.try_recv().unwrap(), ChannelState::Closed);
    }

    #[test]
    fn test_connection_close_fails_everything() {
        let (mut core, state) = connected_core();
        let id = open_channel(&mut core);
        let mut rx1 = rpc(&mut core, id, ids::QUEUE_BIND_OK, AwaitKind::Reply);
        let mut rx2 = rpc(&mut core, 0, ids::CONNECTION_CLOSE_OK, AwaitKind::Reply);
        core.poll_flush();
        core.on_written(Ok(()), Instant::now()).unwrap();

        let err = inbound(
            &mut core,
            0,
            Method::ConnectionClose(CloseReason::new(320, "CONNECTION_FORCED")),
        )
        .unwrap_err();
        assert_eq!(err.reply_code(), Some(320));

        let pending = core.take_pending().unwrap();
        assert_eq!(decode_written(&pending), vec![(0, Method::ConnectionCloseOk)]);

        core.teardown(&err);
        for rx in [&mut rx1, &mut rx2] {
            assert!(matches!(rx.try_recv(), Ok(Err(TransportError::Protocol { code: 320, .. }))));
        }
        assert_eq!(state.get(), ConnectionState::NotConnected);
    }

    #[test]
    fn test_delivery_routed_to_consumer() {
        let (mut core, _) = connected_core();
        let id = open_channel(&mut core);
        let (sink, mut rx) = mpsc::unbounded_channel();
        core.handle_command(
            Command::RegisterConsumer {
                channel: id,
                tag: "orders.q-1".into(),
                sink,
            },
            Instant::now(),
        );

        let mut wire = BytesMut::new();
        Method::BasicDeliver(BasicDeliver {
            consumer_tag: "orders.q-1".into(),
            delivery_tag: 42,
            exchange: "orders".into(),
            ..Default::default()
        })
        .write_frame(&mut wire, id)
        .unwrap();
        let mut header = BytesMut::new();
        ContentHeader::basic(5, BasicProperties::default())
            .encode(&mut header)
            .unwrap();
        crate::protocol::write_frame(&mut wire, FrameType::Header, id, &header);
        crate::protocol::write_frame(&mut wire, FrameType::Body, id, b"he");
        crate::protocol::write_frame(&mut wire, FrameType::Body, id, b"llo");

        // Arrives in awkward slices.
        let (a, b) = wire.split_at(5);
        core.on_data(a, Instant::now()).unwrap();
        core.on_data(b, Instant::now()).unwrap();

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.delivery_tag, 42);
        assert_eq!(&delivery.body[..], b"hello");
    }

    #[test]
    fn test_confirm_mode_publish_waits_for_ack() {
        let (mut core, _) = connected_core();
        let id = open_channel(&mut core);
        let _select = rpc(&mut core, id, ids::CONFIRM_SELECT_OK, AwaitKind::ConfirmSelect);
        inbound(&mut core, id, Method::ConfirmSelectOk).unwrap();

        let mut replies = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            core.handle_command(
                Command::Publish {
                    channel: id,
                    bytes: Bytes::from_static(b"msg"),
                    reply: tx,
                },
                Instant::now(),
            );
            replies.push(rx);
        }
        core.poll_flush();
        core.on_written(Ok(()), Instant::now()).unwrap();
        core.poll_flush();
        assert!(replies[0].try_recv().is_err());

        inbound(
            &mut core,
            id,
            Method::BasicAck {
                delivery_tag: 2,
                multiple: true,
            },
        )
        .unwrap();
        inbound(
            &mut core,
            id,
            Method::BasicNack {
                delivery_tag: 3,
                multiple: false,
                requeue: false,
            },
        )
        .unwrap();

        assert!(matches!(replies[0].try_recv(), Ok(Ok(()))));
        assert!(matches!(replies[1].try_recv(), Ok(Ok(()))));
        assert!(matches!(replies[2].try_recv(), Ok(Err(TransportError::PublishRejected(3)))));
    }

    #[test]
    fn test_broker_cancel_ends_consumer_and_replies() {
        let (mut core, _) = connected_core();
        let id = open_channel(&mut core);
        let (sink, mut rx) = mpsc::unbounded_channel();
        core.handle_command(
            Command::RegisterConsumer {
                channel: id,
                tag: "q-1".into(),
                sink,
            },
            Instant::now(),
        );

        inbound(
            &mut core,
            id,
            Method::BasicCancel {
                consumer_tag: "q-1".into(),
                no_wait: false,
            },
        )
        .unwrap();

        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
        let written = decode_written(&core.poll_flush().unwrap());
        assert_eq!(
            written,
            vec![(id, Method::BasicCancelOk { consumer_tag: "q-1".into() })]
        );
    }

    #[test]
    fn test_get_empty_and_get_ok() {
        let (mut core, _) = connected_core();
        let id = open_channel(&mut core);

        let (awaiting, mut empty) =
            Await::methods(id, &[ids::BASIC_GET_OK, ids::BASIC_GET_EMPTY], AwaitKind::Get);
        core.awaits.register(awaiting);
        inbound(&mut core, id, Method::BasicGetEmpty).unwrap();
        assert!(matches!(empty.try_recv(), Ok(Ok(Reply::Delivery(None)))));

        let (awaiting, mut full) =
            Await::methods(id, &[ids::BASIC_GET_OK, ids::BASIC_GET_EMPTY], AwaitKind::Get);
        core.awaits.register(awaiting);
        inbound(
            &mut core,
            id,
            Method::BasicGetOk(crate::protocol::BasicGetOk {
                delivery_tag: 1,
                message_count: 0,
                ..Default::default()
            }),
        )
        .unwrap();
        assert!(full.try_recv().is_err());

        let mut header = BytesMut::new();
        ContentHeader::basic(0, BasicProperties::default())
            .encode(&mut header)
            .unwrap();
        let mut wire = BytesMut::new();
        crate::protocol::write_frame(&mut wire, FrameType::Header, id, &header);
        core.on_data(&wire, Instant::now()).unwrap();

        match full.try_recv() {
            Ok(Ok(Reply::Delivery(Some(d)))) => assert_eq!(d.delivery_tag, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_begin_close_reports_open_channels() {
        let (mut core, state) = connected_core();
        open_channel(&mut core);
        open_channel(&mut core);

        let (tx, mut rx) = oneshot::channel();
        let directive = core.handle_command(Command::BeginClose { reply: tx }, Instant::now());
        assert_eq!(directive, Directive::DisarmHeartbeat);
        assert_eq!(rx.try_recv().unwrap().unwrap(), Some(vec![1, 2]));
        assert_eq!(state.get(), ConnectionState::Disconnecting);

        let (tx, mut rx) = oneshot::channel();
        core.handle_command(Command::BeginClose { reply: tx }, Instant::now());
        assert_eq!(rx.try_recv().unwrap().unwrap(), None);
    }

    #[test]
    fn test_rpc_on_closed_channel_fails() {
        let (mut core, _) = connected_core();
        let mut rx = rpc(&mut core, 7, ids::QUEUE_BIND_OK, AwaitKind::Reply);
        assert!(matches!(rx.try_recv(), Ok(Err(TransportError::ChannelClosed(7)))));
        assert!(core.poll_flush().is_none());
    }
}
