//! Connection module - the AMQP protocol engine.
//!
//! # Architecture
//!
//! ```text
//! Connection / Channel / Consumer handles
//!          │ Command (unbounded mpsc)
//!          ▼
//! ┌──────────────────────── reactor task ────────────────────────┐
//! │ socket read ─► FrameBuffer ─► AwaitRegistry ─► ChannelSlots   │
//! │ commands    ─► write buffer ─► FlushGate ─► writer task       │
//! │ heartbeat interval                                            │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! All mutable connection state lives in the reactor task; handles only send
//! commands and await oneshot replies.

mod awaiter;
mod config;
mod engine;
mod handle;
mod heartbeat;
mod reactor;
mod state;
mod writer;

pub use awaiter::Reply;
pub use config::{ConnectionConfig, QosConfig, DEFAULT_DSN};
pub use handle::Connection;
pub use state::ConnectionState;

pub(crate) use awaiter::AwaitKind;
pub(crate) use engine::{method_frame, Command, EngineHandle};
pub(crate) use handle::ChannelOpener;
