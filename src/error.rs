//! Error types for the AMQP transport.

use std::sync::Arc;

use thiserror::Error;

/// Main error type for all transport operations.
///
/// The enum is `Clone` because a single failure (a broker-initiated close, a
/// dead socket) is usually delivered to many pending operations at once.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// I/O error on the broker socket.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Connecting or running the handshake failed.
    #[error("Connection failed: {0}")]
    ConnectionFail(#[source] Box<TransportError>),

    /// `connect()` called while the connection is not idle.
    #[error("Client already connected/connecting")]
    AlreadyConnected,

    /// Operation requires an open connection.
    #[error("Client is not connected")]
    NotConnected,

    /// The reactor is gone; the connection was closed underneath the caller.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Broker closed the channel or the connection.
    #[error("Protocol error {code}: {text}")]
    Protocol {
        /// AMQP reply code sent by the broker.
        code: u16,
        /// Reply text sent by the broker.
        text: String,
    },

    /// Malformed or unexpected bytes on the wire.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A frame arrived for a channel that is not open.
    #[error("Received frame on unknown channel #{0}")]
    UnknownChannel(u16),

    /// Operation on a channel that was closed (by the client or the broker).
    #[error("Channel #{0} is closed")]
    ChannelClosed(u16),

    /// Broker answered a confirm-mode publish with Basic.Nack.
    #[error("Broker rejected publish #{0}")]
    PublishRejected(u64),

    /// Every channel id up to `channel_max` is in use.
    #[error("No free channel id (channel_max = {0})")]
    ChannelsExhausted(u16),

    /// Publishing a package failed.
    #[error("Send message failed: {0}")]
    SendMessageFailed(#[source] Box<TransportError>),

    /// Declaring an exchange failed.
    #[error("Create topic failed: {0}")]
    CreateTopicFailed(#[source] Box<TransportError>),

    /// Declaring a queue failed.
    #[error("Create queue failed: {0}")]
    CreateQueueFailed(#[source] Box<TransportError>),

    /// Declaring or binding a bound exchange failed.
    #[error("Bind failed: {0}")]
    BindFailed(#[source] Box<TransportError>),

    /// Payload encoding/decoding error.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid connection configuration (bad DSN, out-of-range value).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Connect timeout elapsed.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl TransportError {
    /// Build a broker close error from its reply code and text.
    pub fn protocol(code: u16, text: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            text: text.into(),
        }
    }

    /// Reply code carried by a broker-initiated close, looking through wrappers.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            Self::ConnectionFail(inner)
            | Self::SendMessageFailed(inner)
            | Self::CreateTopicFailed(inner)
            | Self::CreateQueueFailed(inner)
            | Self::BindFailed(inner) => inner.reply_code(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransportError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<url::ParseError> for TransportError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

/// Result type alias using TransportError.
pub type Result<T> = std::result::Result<T, TransportError>;
