//! Transport module - the message-bus facade over the AMQP client.
//!
//! - [`AmqpTransport`]: connect, declare topology, consume and send
//! - [`Topic`], [`Queue`] and their binds: topology descriptions
//! - [`OutboundPackage`], [`IncomingPackage`]: messages as the bus sees them

mod amqp;
mod package;
mod topology;

pub use amqp::{AmqpTransport, SendCompletion};
pub use package::{Destination, IncomingPackage, OutboundPackage};
pub use topology::{
    Queue, QueueBind, Topic, TopicBind, TopicKind, DEAD_LETTER_EXCHANGE_ARGUMENT,
    DELAYED_TYPE_ARGUMENT,
};
