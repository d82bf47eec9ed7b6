use std::time::Duration;

use tokio::time::Instant;

/// Liveness bookkeeping for the currently open connection. Lives exactly as
/// long as the lifecycle stays `Open`.
#[derive(Debug, Clone)]
pub struct HeartbeatTicket {
    interval: Duration,
    last_sent_at: Option<Instant>,
    last_received_at: Instant,
}

impl HeartbeatTicket {
    /// The open handshake itself counts as the first sign of life.
    pub fn start(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_sent_at: None,
            last_received_at: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_sent_at(&self) -> Option<Instant> {
        self.last_sent_at
    }

    pub fn last_received_at(&self) -> Instant {
        self.last_received_at
    }

    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent_at = Some(now);
    }

    pub fn record_received(&mut self, now: Instant) {
        if now > self.last_received_at {
            self.last_received_at = now;
        }
    }

    /// Silence longer than this means the connection is dead.
    pub fn silence_limit(&self) -> Duration {
        self.interval.saturating_mul(2)
    }

    /// `None` when the deadline lies beyond what the clock can represent.
    pub fn watchdog_deadline(&self) -> Option<Instant> {
        self.last_received_at.checked_add(self.silence_limit())
    }

    pub fn is_silent(&self, now: Instant) -> bool {
        self.watchdog_deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Time left before the watchdog should look again.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.watchdog_deadline() {
            Some(deadline) => deadline.saturating_duration_since(now),
            None => self.silence_limit(),
        }
    }
}
