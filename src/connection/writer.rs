//! Socket writer task and the flush gate.
//!
//! # Architecture
//!
//! ```text
//! Reactor ── write buffer ──► FlushGate ── chunk ──► Writer task ─► socket
//!    ▲                                                    │
//!    └──────────────────── write result ──────────────────┘
//! ```
//!
//! The reactor appends frames to one write buffer. At most one chunk is with
//! the writer task at a time. A flush cycle starts when the buffer gets
//! bytes and ends when a write completes with the buffer empty; everyone who
//! asked for a flush during the cycle is resolved together.

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, TransportError};

/// Callers waiting for the write buffer to drain.
#[derive(Debug, Default)]
pub(crate) struct FlushGate {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    cycles: u64,
}

impl FlushGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the current (or next) flush cycle.
    pub fn wait(&mut self, waiter: oneshot::Sender<Result<()>>) {
        self.waiters.push(waiter);
    }

    /// Mark a cycle as running; repeated calls within a cycle are no-ops.
    pub fn start(&mut self) {
        if !self.in_flight {
            self.in_flight = true;
            self.cycles += 1;
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Number of flush cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Buffer drained: end the cycle and resolve everyone.
    pub fn complete(&mut self) {
        self.in_flight = false;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Write failed: end the cycle and fail everyone.
    pub fn fail(&mut self, err: &TransportError) {
        self.in_flight = false;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }
}

/// Handle to the writer task.
pub(crate) struct WriterHandle {
    tx: mpsc::UnboundedSender<Bytes>,
    done: mpsc::UnboundedReceiver<std::io::Result<()>>,
    task: JoinHandle<()>,
}

impl WriterHandle {
    /// Hand a chunk to the writer task.
    pub fn write(&self, chunk: Bytes) -> Result<()> {
        self.tx.send(chunk).map_err(|_| TransportError::ConnectionClosed)
    }

    /// Result of the oldest outstanding write. `None` once the task is gone.
    pub async fn completed(&mut self) -> Option<std::io::Result<()>> {
        self.done.recv().await
    }

    /// Stop accepting chunks; queued ones are still written, then the socket
    /// is shut down.
    pub fn close(self) -> JoinHandle<()> {
        drop(self.tx);
        self.task
    }
}

/// Spawn the writer task owning the socket's write half.
pub(crate) fn spawn_writer<W>(writer: W) -> WriterHandle
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let (done_tx, done) = mpsc::unbounded_channel();
    let task = tokio::spawn(writer_loop(rx, done_tx, writer));
    WriterHandle { tx, done, task }
}

async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    done: mpsc::UnboundedSender<std::io::Result<()>>,
    mut writer: W,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        let result = write_chunk(&mut writer, &chunk).await;
        let failed = result.is_err();
        if let Err(e) = &result {
            tracing::debug!(error = %e, bytes = chunk.len(), "Socket write failed");
        }
        let _ = done.send(result);
        if failed {
            return;
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(chunk).await?;
    writer.flush().await
}
