//! Exchanges, queues and the bindings between them.

use std::fmt;

use crate::protocol::{ExchangeDeclare, FieldTable, FieldValue, QueueDeclare};

/// Argument naming the routing type of a delayed-message exchange.
pub const DELAYED_TYPE_ARGUMENT: &str = "x-delayed-type";

/// Argument naming a queue's dead-letter exchange.
pub const DEAD_LETTER_EXCHANGE_ARGUMENT: &str = "x-dead-letter-exchange";

/// Exchange type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Direct,
    Fanout,
    Topic,
    Headers,
    /// `x-delayed-message`, provided by the delayed-message broker plugin.
    Delayed,
}

impl TopicKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TopicKind::Direct => "direct",
            TopicKind::Fanout => "fanout",
            TopicKind::Topic => "topic",
            TopicKind::Headers => "headers",
            TopicKind::Delayed => "x-delayed-message",
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub name: String,
    pub kind: TopicKind,
    pub passive: bool,
    pub durable: bool,
    pub arguments: FieldTable,
}

impl Topic {
    pub fn new(name: impl Into<String>, kind: TopicKind) -> Self {
        Self {
            name: name.into(),
            kind,
            passive: false,
            durable: false,
            arguments: FieldTable::new(),
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self::new(name, TopicKind::Direct)
    }

    pub fn fanout(name: impl Into<String>) -> Self {
        Self::new(name, TopicKind::Fanout)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, TopicKind::Topic)
    }

    /// Durable `x-delayed-message` exchange routing like a direct exchange.
    pub fn delayed(name: impl Into<String>) -> Self {
        Self::new(name, TopicKind::Delayed)
            .durable()
            .with_argument(DELAYED_TYPE_ARGUMENT, TopicKind::Direct.as_str())
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Only check that the exchange exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub(crate) fn declare_args(&self) -> ExchangeDeclare {
        ExchangeDeclare {
            exchange: self.name.clone(),
            kind: self.kind.as_str().to_string(),
            passive: self.passive,
            durable: self.durable,
            auto_delete: false,
            internal: false,
            arguments: self.arguments.clone(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Queue {
    pub name: String,
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

impl Queue {
    /// Non-durable, non-exclusive queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passive: false,
            durable: false,
            exclusive: false,
            auto_delete: false,
            arguments: FieldTable::new(),
        }
    }

    /// Durable queue whose dead letters go to `exchange`.
    pub fn delayed(name: impl Into<String>, exchange: &Topic) -> Self {
        Self::new(name)
            .durable()
            .with_argument(DEAD_LETTER_EXCHANGE_ARGUMENT, exchange.name.as_str())
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Only check that the queue exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub(crate) fn declare_args(&self) -> QueueDeclare {
        QueueDeclare {
            queue: self.name.clone(),
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            arguments: self.arguments.clone(),
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Binds a topic to another topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicBind {
    pub topic: Topic,
    pub routing_key: Option<String>,
}

impl TopicBind {
    pub fn new(topic: Topic, routing_key: Option<&str>) -> Self {
        Self {
            topic,
            routing_key: routing_key.map(str::to_string),
        }
    }

    pub(crate) fn routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or_default()
    }
}

/// Binds a queue to a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBind {
    pub topic: Topic,
    pub routing_key: Option<String>,
}

impl QueueBind {
    pub fn new(topic: Topic, routing_key: Option<&str>) -> Self {
        Self {
            topic,
            routing_key: routing_key.map(str::to_string),
        }
    }

    pub(crate) fn routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or_default()
    }
}
