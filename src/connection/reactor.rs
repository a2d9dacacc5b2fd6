//! The reactor task: one per connection.
//!
//! Multiplexes four event sources with `tokio::select!`:
//!
//! - socket reads, fed to the frame buffer
//! - commands from handles
//! - write completions from the writer task
//! - the heartbeat timer
//!
//! After every event the engine is asked for the next chunk to write.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::engine::{Command, Directive, EngineCore, EngineHandle};
use super::state::StateTracker;
use super::writer::{spawn_writer, WriterHandle};
use crate::error::{Result, TransportError};

/// Initial capacity of the read buffer.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How long the writer gets to drain after the reactor stops.
const WRITER_GRACE: Duration = Duration::from_secs(1);

enum Event {
    Read(std::io::Result<usize>),
    Command(Option<Command>),
    Written(Option<std::io::Result<()>>),
    Heartbeat,
}

struct Reactor<R> {
    core: EngineCore,
    reader: R,
    read_buf: BytesMut,
    commands: mpsc::UnboundedReceiver<Command>,
    writer: WriterHandle,
    heartbeat: Option<Interval>,
}

/// Start the reactor and writer tasks over a split stream.
pub(crate) fn spawn<R, W>(state: StateTracker, reader: R, writer: W) -> (EngineHandle, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, commands) = mpsc::unbounded_channel();
    let reactor = Reactor {
        core: EngineCore::new(state),
        reader,
        read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
        commands,
        writer: spawn_writer(writer),
        heartbeat: None,
    };
    (EngineHandle::new(tx), tokio::spawn(reactor.run()))
}

impl<R> Reactor<R>
where
    R: AsyncRead + Unpin,
{
    async fn run(mut self) {
        let err = match self.drive().await {
            Ok(()) => TransportError::ConnectionClosed,
            Err(err) => {
                tracing::error!(error = %err, "Connection failed");
                err
            }
        };

        let Reactor {
            mut core, writer, ..
        } = self;

        // Best effort: a pending Close-Ok or similar still goes out.
        if let Some(chunk) = core.take_pending() {
            let _ = writer.write(chunk);
        }
        core.teardown(&err);

        let mut task = writer.close();
        if tokio::time::timeout(WRITER_GRACE, &mut task).await.is_err() {
            tracing::debug!("Writer did not drain in time");
            task.abort();
        }
        tracing::debug!("Reactor stopped");
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            let event = {
                let Reactor {
                    core,
                    reader,
                    read_buf,
                    commands,
                    writer,
                    heartbeat,
                } = self;
                let writing = core.is_writing();

                tokio::select! {
                    read = reader.read_buf(read_buf) => Event::Read(read),
                    command = commands.recv() => Event::Command(command),
                    written = writer.completed(), if writing => Event::Written(written),
                    _ = next_tick(heartbeat) => Event::Heartbeat,
                }
            };

            let now = Instant::now();
            match event {
                Event::Read(Ok(0)) => {
                    tracing::debug!("Broker closed the socket");
                    return Err(TransportError::ConnectionClosed);
                }
                Event::Read(Ok(_)) => {
                    self.core.on_data(&self.read_buf, now)?;
                    self.read_buf.clear();
                }
                Event::Read(Err(e)) => return Err(e.into()),
                // Every handle is gone.
                Event::Command(None) => return Ok(()),
                Event::Command(Some(command)) => match self.core.handle_command(command, now) {
                    Directive::Continue => {}
                    Directive::ArmHeartbeat(period) => {
                        tracing::debug!(?period, "Heartbeat armed");
                        self.heartbeat = Some(heartbeat_timer(period));
                    }
                    Directive::DisarmHeartbeat => self.heartbeat = None,
                    Directive::Stop => return Ok(()),
                },
                Event::Written(Some(result)) => self.core.on_written(result, now)?,
                Event::Written(None) => return Err(TransportError::ConnectionClosed),
                Event::Heartbeat => self.core.on_heartbeat_tick(now)?,
            }

            if let Some(chunk) = self.core.poll_flush() {
                tracing::trace!(bytes = chunk.len(), "Writing chunk");
                self.writer.write(chunk)?;
            }
        }
    }
}

fn heartbeat_timer(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
