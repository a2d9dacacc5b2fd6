//! Pending-reply registry.
//!
//! Every request that expects an answer registers an [`Await`] before its
//! bytes are queued. Inbound methods are offered to the registry in arrival
//! order; the oldest await on the same channel whose predicate accepts the
//! method consumes it. Unmatched awaits stay queued.

use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::consumer::Delivery;
use crate::error::{Result, TransportError};
use crate::protocol::{Method, MethodId};

/// What a resolved await hands back.
#[derive(Debug)]
pub enum Reply {
    /// The matching method.
    Method(Method),
    /// Outcome of Basic.Get: a message, or `None` for Basic.GetEmpty.
    Delivery(Option<Delivery>),
}

/// Side effect the engine applies when the await is matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AwaitKind {
    /// Plain reply.
    Reply,
    /// Channel.OpenOk marks the channel open.
    ChannelOpen,
    /// Channel.CloseOk releases the channel id.
    ChannelClose,
    /// Confirm.SelectOk turns on publisher confirms.
    ConfirmSelect,
    /// Basic.GetOk waits for its content before resolving.
    Get,
    /// Basic.CancelOk ends the consumer's stream.
    Cancel(String),
}

/// Which inbound methods an await accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Predicate {
    /// Any of these methods.
    Methods(Vec<MethodId>),
    /// Basic.Ack / Basic.Nack covering this publish sequence number.
    Confirm { delivery_tag: u64 },
}

impl Predicate {
    fn accepts(&self, method: &Method) -> bool {
        match self {
            Predicate::Methods(ids) => ids.contains(&method.id()),
            Predicate::Confirm { delivery_tag } => match *method {
                Method::BasicAck {
                    delivery_tag: tag,
                    multiple,
                }
                | Method::BasicNack {
                    delivery_tag: tag,
                    multiple,
                    ..
                } => covers(*delivery_tag, tag, multiple),
                _ => false,
            },
        }
    }
}

/// Whether a confirm for `tag` (with `multiple`) covers sequence `seq`.
fn covers(seq: u64, tag: u64, multiple: bool) -> bool {
    if multiple {
        seq <= tag
    } else {
        seq == tag
    }
}

/// Where a result goes.
#[derive(Debug)]
pub(crate) enum Responder {
    Reply(oneshot::Sender<Result<Reply>>),
    /// Caller only wants success or failure.
    Done(oneshot::Sender<Result<()>>),
}

/// A registered expectation of a reply.
#[derive(Debug)]
pub(crate) struct Await {
    pub channel: u16,
    pub predicate: Predicate,
    pub kind: AwaitKind,
    responder: Responder,
}

impl Await {
    pub fn new(channel: u16, predicate: Predicate, kind: AwaitKind, responder: Responder) -> Self {
        Self {
            channel,
            predicate,
            kind,
            responder,
        }
    }

    /// Await any of `ids` on `channel`, answering through a fresh oneshot.
    pub fn methods(
        channel: u16,
        ids: &[MethodId],
        kind: AwaitKind,
    ) -> (Self, oneshot::Receiver<Result<Reply>>) {
        let (tx, rx) = oneshot::channel();
        let this = Self::new(
            channel,
            Predicate::Methods(ids.to_vec()),
            kind,
            Responder::Reply(tx),
        );
        (this, rx)
    }

    /// Deliver the outcome. A caller that stopped waiting is ignored.
    pub fn resolve(self, result: Result<Reply>) {
        match self.responder {
            Responder::Reply(tx) => {
                let _ = tx.send(result);
            }
            Responder::Done(tx) => {
                let _ = tx.send(result.map(|_| ()));
            }
        }
    }
}

/// FIFO registry of pending awaits.
#[derive(Debug, Default)]
pub(crate) struct AwaitRegistry {
    pending: VecDeque<Await>,
}

impl AwaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, awaiting: Await) {
        self.pending.push_back(awaiting);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove and return the oldest await on `channel` accepting `method`.
    pub fn take_match(&mut self, channel: u16, method: &Method) -> Option<Await> {
        let index = self
            .pending
            .iter()
            .position(|a| a.channel == channel && a.predicate.accepts(method))?;
        self.pending.remove(index)
    }

    /// Remove every confirm await on `channel` covered by `method`
    /// (one for a single confirm, possibly many with `multiple`).
    pub fn take_confirms(&mut self, channel: u16, method: &Method) -> Vec<Await> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for a in self.pending.drain(..) {
            let is_confirm = matches!(a.predicate, Predicate::Confirm { .. });
            if a.channel == channel && is_confirm && a.predicate.accepts(method) {
                taken.push(a);
            } else {
                kept.push_back(a);
            }
        }
        self.pending = kept;
        taken
    }

    /// Fail every await on `channel`.
    pub fn fail_channel(&mut self, channel: u16, err: &TransportError) {
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for a in self.pending.drain(..) {
            if a.channel == channel {
                a.resolve(Err(err.clone()));
            } else {
                kept.push_back(a);
            }
        }
        self.pending = kept;
    }

    /// Fail every await on every channel.
    pub fn fail_all(&mut self, err: &TransportError) {
        for a in self.pending.drain(..) {
            a.resolve(Err(err.clone()));
        }
    }
}
