//! Heartbeat bookkeeping.
//!
//! The reactor ticks on a fixed interval; a heartbeat frame goes out only
//! when nothing was written for a whole interval. On the receive side, two
//! intervals of silence from the broker mean the peer is gone.

use std::time::Duration;

use tokio::time::Instant;

/// Missed intervals tolerated before the broker is considered dead.
const MISSED_BEATS: u32 = 2;

#[derive(Debug, Default)]
pub(crate) struct Heartbeat {
    interval: Option<Duration>,
    last_write: Option<Instant>,
    last_read: Option<Instant>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, interval: Duration, now: Instant) {
        self.interval = Some(interval);
        self.last_read = Some(now);
    }

    pub fn disarm(&mut self) {
        self.interval = None;
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn record_write(&mut self, now: Instant) {
        self.last_write = Some(now);
    }

    pub fn record_read(&mut self, now: Instant) {
        self.last_read = Some(now);
    }

    /// A heartbeat should be sent: armed, and idle for at least one interval.
    pub fn due(&self, now: Instant) -> bool {
        match (self.interval, self.last_write) {
            (Some(interval), Some(last)) => now.saturating_duration_since(last) >= interval,
            _ => false,
        }
    }

    /// The broker has been silent for too long.
    pub fn peer_silent(&self, now: Instant) -> Option<Duration> {
        let interval = self.interval?;
        let last = self.last_read?;
        let silence = now.saturating_duration_since(last);
        (silence >= interval * MISSED_BEATS).then_some(silence)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
