//! Notification triage: turns inbound frames into feed entries.
//!
//! Control frames are swallowed, domain events land at the head of a bounded
//! newest-first feed, and high-priority events additionally go out on the
//! interrupt channel. Priority never changes placement in the feed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::frame::{parse_frame, ControlKind, DomainEvent, InboundFrame, Priority};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Assigned locally; never taken from the wire.
    pub local_id: u64,
    pub event_type: String,
    pub title: Option<String>,
    pub message: Option<String>,
    pub priority: Priority,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub server_timestamp: Option<OffsetDateTime>,
    pub read: bool,
}

impl Notification {
    /// Title for display, falling back to the event type.
    pub fn headline(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.event_type)
    }
}

/// Newest-first feed bounded to a fixed capacity.
#[derive(Debug, Clone)]
pub struct NotificationBuffer {
    entries: VecDeque<Notification>,
    capacity: usize,
}

impl NotificationBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Inserts at the head, returning the evicted tail entry if the feed was full.
    pub fn push(&mut self, notification: Notification) -> Option<Notification> {
        self.entries.push_front(notification);
        if self.entries.len() > self.capacity {
            self.entries.pop_back()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Notification> {
        self.entries.iter()
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.entries.iter().cloned().collect()
    }

    pub fn mark_read(&mut self, local_id: u64) -> bool {
        match self.entries.iter_mut().find(|entry| entry.local_id == local_id) {
            Some(entry) => {
                entry.read = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_read(&mut self) {
        for entry in &mut self.entries {
            entry.read = true;
        }
    }

    pub fn unread_count(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.read).count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Shared, lock-protected feed read by the UI while triage writes to it.
pub type SharedFeed = Arc<RwLock<NotificationBuffer>>;

#[derive(Debug, Clone, PartialEq)]
pub enum TriageOutcome {
    Control(ControlKind),
    Buffered { local_id: u64, interrupt: bool },
    Dropped(ProtocolError),
}

pub struct Triage {
    feed: SharedFeed,
    next_local_id: u64,
    dropped: Arc<AtomicU64>,
    interrupts: broadcast::Sender<Notification>,
}

impl Triage {
    pub fn new(
        feed: SharedFeed,
        interrupts: broadcast::Sender<Notification>,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        Self {
            feed,
            next_local_id: 1,
            dropped,
            interrupts,
        }
    }

    /// Parses and classifies one raw text frame.
    pub fn on_text(&mut self, text: &str) -> TriageOutcome {
        match parse_frame(text) {
            Ok(frame) => self.on_frame(frame),
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("opsdeck_notify_frames_dropped_total", 1);
                warn!(
                    target = "opsdeck::triage",
                    error = %err,
                    bytes = text.len(),
                    "dropping unparseable frame"
                );
                TriageOutcome::Dropped(err)
            }
        }
    }

    pub fn on_frame(&mut self, frame: InboundFrame) -> TriageOutcome {
        match frame {
            InboundFrame::Control(kind) => {
                debug!(target = "opsdeck::triage", ?kind, "control frame");
                TriageOutcome::Control(kind)
            }
            InboundFrame::Domain(event) => self.buffer(event),
        }
    }

    fn buffer(&mut self, event: DomainEvent) -> TriageOutcome {
        let local_id = self.next_local_id;
        self.next_local_id += 1;
        let interrupt = event.priority.is_interrupt();
        let notification = Notification {
            local_id,
            event_type: event.event_type,
            title: event.title,
            message: event.message,
            priority: event.priority,
            received_at: OffsetDateTime::now_utc(),
            server_timestamp: event.server_timestamp,
            read: false,
        };

        let evicted = self.feed.write().push(notification.clone());
        if let Some(evicted) = evicted {
            debug!(
                target = "opsdeck::triage",
                evicted = evicted.local_id,
                "feed at capacity; evicted oldest notification"
            );
        }
        counter!(
            "opsdeck_notify_notifications_total",
            1,
            "priority" => notification.priority.to_string()
        );

        if interrupt {
            counter!("opsdeck_notify_interrupts_total", 1);
            debug!(
                target = "opsdeck::triage",
                local_id,
                event_type = %notification.event_type,
                "raising interrupt"
            );
            // No subscribers is fine; the feed entry still exists.
            let _ = self.interrupts.send(notification);
        }

        TriageOutcome::Buffered {
            local_id,
            interrupt,
        }
    }

    pub fn feed(&self) -> &SharedFeed {
        &self.feed
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
