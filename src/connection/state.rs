//! Connection lifecycle state.
//!
//! ```text
//! NotConnected --connect--> Connecting --handshake ok--> Connected
//!      ^                                                    |
//!      +------------- Disconnecting <----disconnect---------+
//! ```
//!
//! Any state may drop straight to `NotConnected` on a fatal error.

use std::sync::Arc;

use tokio::sync::watch;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    NotConnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Whether `self -> next` is an edge of the lifecycle.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (NotConnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Disconnecting)
                | (_, NotConnected)
        )
    }
}

/// Shared, observable connection state.
///
/// The handle and the reactor task both hold one; only legal edges are
/// applied.
#[derive(Debug, Clone)]
pub(crate) struct StateTracker {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl StateTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::NotConnected);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Apply `next` if it is a legal edge from the current state.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|state| {
            if *state != next && state.can_transition_to(next) {
                tracing::trace!(from = ?*state, to = ?next, "Connection state change");
                *state = next;
                applied = true;
            }
            applied
        });
        applied
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}
