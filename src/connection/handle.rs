//! The public connection handle.

use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::awaiter::AwaitKind;
use super::config::{ConnectionConfig, QosConfig};
use super::engine::{method_frame, Command, EngineHandle};
use super::reactor;
use super::state::{ConnectionState, StateTracker};
use crate::channel::Channel;
use crate::error::{Result, TransportError};
use crate::protocol::{
    ids, CloseReason, ConnectionStartOk, FieldTable, FieldValue, Method, Tune,
    DEFAULT_CHANNEL_MAX, DEFAULT_FRAME_MAX, MIN_FRAME_MAX, PROTOCOL_HEADER,
};

const AUTH_MECHANISM: &str = "PLAIN";
const LOCALE: &str = "en_US";

/// One AMQP connection to a broker.
///
/// The handle owns the reactor task. It can be reconnected after a
/// disconnect or a connection failure.
///
/// # Example
///
/// ```ignore
/// let mut connection = Connection::new(ConnectionConfig::from_dsn(dsn)?, QosConfig::default());
/// connection.connect().await?;
/// let channel = connection.channel().await?;
/// channel.queue_declare(QueueDeclare { queue: "jobs".into(), ..Default::default() }).await?;
/// connection.disconnect(0, "").await?;
/// ```
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    qos: QosConfig,
    state: StateTracker,
    engine: Option<EngineHandle>,
    tuning: Tune,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(config: ConnectionConfig, qos: QosConfig) -> Self {
        Self {
            config,
            qos,
            state: StateTracker::new(),
            engine: None,
            tuning: default_tuning(),
            task: None,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Observe state changes, including failures detected by the reactor.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Limits negotiated in the last handshake.
    pub fn tuning(&self) -> Tune {
        self.tuning
    }

    pub fn is_connected(&self) -> bool {
        self.state.get() == ConnectionState::Connected
    }

    /// Open a TCP connection to the configured broker and run the handshake.
    ///
    /// The connect timeout applies to the TCP connect and again to the
    /// handshake; `timeout = 0` waits indefinitely.
    pub async fn connect(&mut self) -> Result<()> {
        let limit = self.checked_timeout()?;
        self.begin_connect()?;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let connecting = async {
            TcpStream::connect(addr.as_str())
                .await
                .map_err(TransportError::from)
        };
        let stream = match within(limit, connecting).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(addr = %addr, error = %err, "TCP connect failed");
                self.state.transition(ConnectionState::NotConnected);
                return Err(err);
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        self.start(stream, limit).await
    }

    /// Run the connection over an already established stream.
    ///
    /// The handshake is bounded by the connect timeout.
    pub async fn connect_with_stream<S>(&mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let limit = self.checked_timeout()?;
        self.begin_connect()?;
        self.start(stream, limit).await
    }

    /// Connect timeout, after checking every timing field of the config.
    fn checked_timeout(&self) -> Result<Duration> {
        self.config.validate()?;
        self.config.connect_timeout()
    }

    fn begin_connect(&mut self) -> Result<()> {
        if !self.state.transition(ConnectionState::Connecting) {
            return Err(TransportError::AlreadyConnected);
        }
        Ok(())
    }

    async fn start<S>(&mut self, stream: S, limit: Duration) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (engine, task) = reactor::spawn(self.state.clone(), reader, writer);
        self.engine = Some(engine.clone());
        self.task = Some(task);

        match within(limit, self.handshake(&engine)).await {
            Ok(tuning) => {
                self.tuning = tuning;
                tracing::info!(
                    host = %self.config.host,
                    port = self.config.port,
                    vhost = %self.config.vhost,
                    frame_max = tuning.frame_max,
                    channel_max = tuning.channel_max,
                    heartbeat = tuning.heartbeat,
                    "Connected to broker"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "Handshake failed");
                self.shutdown().await;
                Err(err)
            }
        }
    }

    async fn handshake(&self, engine: &EngineHandle) -> Result<Tune> {
        let start = engine
            .request(
                0,
                Bytes::from_static(PROTOCOL_HEADER),
                &[ids::CONNECTION_START],
                AwaitKind::Reply,
            )
            .await?;
        let Method::ConnectionStart(start) = start else {
            return Err(unexpected(&start));
        };
        if !start
            .mechanisms
            .split_whitespace()
            .any(|m| m == AUTH_MECHANISM)
        {
            return Err(TransportError::ProtocolViolation(format!(
                "Broker does not offer {} authentication (offers \"{}\")",
                AUTH_MECHANISM, start.mechanisms
            )));
        }

        let start_ok = Method::ConnectionStartOk(ConnectionStartOk {
            client_properties: client_properties(),
            mechanism: AUTH_MECHANISM.to_string(),
            response: plain_response(&self.config.user, &self.config.password),
            locale: LOCALE.to_string(),
        });
        let tune = engine
            .request(0, method_frame(0, &start_ok)?, &[ids::CONNECTION_TUNE], AwaitKind::Reply)
            .await?;
        let Method::ConnectionTune(server) = tune else {
            return Err(unexpected(&tune));
        };

        let tuning = negotiate(server, self.config.heartbeat_secs())?;
        engine.send(Command::Tune(tuning))?;

        let mut buf = BytesMut::with_capacity(128);
        Method::ConnectionTuneOk(tuning).write_frame(&mut buf, 0)?;
        Method::ConnectionOpen {
            virtual_host: self.config.vhost.clone(),
        }
        .write_frame(&mut buf, 0)?;
        engine
            .request(0, buf.freeze(), &[ids::CONNECTION_OPEN_OK], AwaitKind::Reply)
            .await?;

        let heartbeat = self.config.heartbeat_interval()?;
        engine
            .call(|reply| Command::Established { heartbeat, reply })
            .await?;
        Ok(tuning)
    }

    fn engine(&self) -> Result<&EngineHandle> {
        match &self.engine {
            Some(engine) if self.is_connected() => Ok(engine),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Open a new channel and apply the configured QoS to it.
    pub async fn channel(&self) -> Result<Channel> {
        self.opener()?.open().await
    }

    /// Channel factory for this connection that can move into a task.
    pub(crate) fn opener(&self) -> Result<ChannelOpener> {
        Ok(ChannelOpener {
            engine: self.engine()?.clone(),
            qos: self.qos,
            frame_max: self.tuning.frame_max,
        })
    }

    /// Close the connection.
    ///
    /// With `reply_code == 0` every open channel is closed first. The reactor
    /// is stopped and the state returns to `NotConnected` even when the close
    /// handshake fails. Calling this while a close is running is a no-op.
    pub async fn disconnect(&mut self, reply_code: u16, reply_text: &str) -> Result<()> {
        let Some(engine) = self.engine.clone() else {
            return Err(TransportError::NotConnected);
        };

        let open_channels = match engine
            .call(|reply| Command::BeginClose { reply })
            .await
            .and_then(|begin| begin)
        {
            Ok(Some(open)) => open,
            Ok(None) => return Ok(()),
            Err(TransportError::NotConnected) => return Err(TransportError::NotConnected),
            Err(err) => {
                tracing::debug!(error = %err, "Reactor already gone");
                self.shutdown().await;
                return Err(TransportError::NotConnected);
            }
        };

        let result = self
            .close_handshake(&engine, open_channels, reply_code, reply_text)
            .await;
        if let Err(err) = &result {
            tracing::warn!(error = %err, "Close handshake failed");
        }
        self.shutdown().await;
        tracing::info!(host = %self.config.host, reply_code, "Disconnected from broker");
        result
    }

    async fn close_handshake(
        &self,
        engine: &EngineHandle,
        open_channels: Vec<u16>,
        reply_code: u16,
        reply_text: &str,
    ) -> Result<()> {
        if reply_code == 0 {
            let closes = open_channels.into_iter().map(|id| {
                let channel = Channel::new(id, engine.clone(), self.tuning.frame_max);
                async move {
                    if let Err(err) = channel.close(reply_code, reply_text).await {
                        tracing::debug!(channel = id, error = %err, "Channel close failed");
                    }
                }
            });
            join_all(closes).await;
        }

        let close = Method::ConnectionClose(CloseReason::new(reply_code, reply_text));
        engine
            .request(0, method_frame(0, &close)?, &[ids::CONNECTION_CLOSE_OK], AwaitKind::Reply)
            .await?;
        Ok(())
    }

    /// Stop the reactor and wait for it to finish its teardown.
    async fn shutdown(&mut self) {
        if let Some(engine) = self.engine.take() {
            let _ = engine.send(Command::Shutdown);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "Reactor task ended abnormally");
            }
        }
        self.tuning = default_tuning();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            let _ = engine.send(Command::Shutdown);
        }
    }
}

/// Opens channels on one established connection.
///
/// Stays usable only while that connection does; afterwards `open` fails
/// with the reactor's error.
#[derive(Debug, Clone)]
pub(crate) struct ChannelOpener {
    engine: EngineHandle,
    qos: QosConfig,
    frame_max: u32,
}

impl ChannelOpener {
    pub(crate) async fn open(&self) -> Result<Channel> {
        let engine = &self.engine;
        let id = engine
            .call(|reply| Command::AllocateChannel { reply })
            .await??;

        let open = method_frame(id, &Method::ChannelOpen)?;
        if let Err(err) = engine
            .request(id, open, &[ids::CHANNEL_OPEN_OK], AwaitKind::ChannelOpen)
            .await
        {
            let _ = engine.send(Command::ReleaseChannel { channel: id });
            return Err(err);
        }

        let channel = Channel::new(id, engine.clone(), self.frame_max);
        channel
            .qos(self.qos.prefetch_size, self.qos.prefetch_count, self.qos.global)
            .await?;
        tracing::debug!(channel = id, "Channel opened");
        Ok(channel)
    }
}

/// Run `fut` under `limit`; a zero limit means no limit.
async fn within<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    if limit.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TransportError::Timeout(limit))?
}

fn default_tuning() -> Tune {
    Tune {
        channel_max: DEFAULT_CHANNEL_MAX,
        frame_max: DEFAULT_FRAME_MAX,
        heartbeat: 0,
    }
}

/// Pick the limits sent back in Connection.TuneOk.
///
/// The server's frame max is adopted (`0` meaning the default); its channel
/// max only when non-zero. The heartbeat is the client's setting. A frame
/// max below the protocol minimum is refused.
pub(crate) fn negotiate(server: Tune, heartbeat: u16) -> Result<Tune> {
    let frame_max = match server.frame_max {
        0 => DEFAULT_FRAME_MAX,
        max if max < MIN_FRAME_MAX => {
            return Err(TransportError::ProtocolViolation(format!(
                "Broker frame max {} is below the minimum {}",
                max, MIN_FRAME_MAX
            )));
        }
        max => max,
    };
    Ok(Tune {
        channel_max: if server.channel_max > 0 {
            server.channel_max
        } else {
            DEFAULT_CHANNEL_MAX
        },
        frame_max,
        heartbeat,
    })
}

fn plain_response(user: &str, password: &str) -> Bytes {
    let mut response = BytesMut::with_capacity(user.len() + password.len() + 2);
    response.extend_from_slice(b"\0");
    response.extend_from_slice(user.as_bytes());
    response.extend_from_slice(b"\0");
    response.extend_from_slice(password.as_bytes());
    response.freeze()
}

fn client_properties() -> FieldTable {
    let capabilities: FieldTable = [
        "publisher_confirms",
        "exchange_exchange_bindings",
        "basic.nack",
        "consumer_cancel_notify",
        "connection.blocked",
        "authentication_failure_close",
    ]
    .into_iter()
    .map(|name| (name.to_string(), FieldValue::Bool(true)))
    .collect();

    FieldTable::from([
        ("product".to_string(), FieldValue::from(env!("CARGO_PKG_NAME"))),
        ("version".to_string(), FieldValue::from(env!("CARGO_PKG_VERSION"))),
        ("platform".to_string(), FieldValue::from("Rust")),
        ("capabilities".to_string(), FieldValue::Table(capabilities)),
    ])
}

fn unexpected(method: &Method) -> TransportError {
    TransportError::ProtocolViolation(format!("Unexpected handshake reply {}", method.id()))
}
