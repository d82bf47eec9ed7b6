//! Persistent notification channel for the opsdeck dashboard.
//!
//! The crate keeps one long-lived channel per authenticated identity open to
//! the notification service, reconnects with exponential backoff, watches
//! for silent links with a heartbeat watchdog and triages inbound frames into
//! a bounded newest-first feed. A separate [`poll`] module covers one-shot
//! flows that poll a REST status endpoint instead.
//!
//! Start with [`NotificationClient`]; [`Lifecycle`] is the pure state machine
//! underneath it.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod identity;
pub mod lifecycle;
pub mod poll;
mod timer;
pub mod transport;
pub mod triage;

pub use backoff::{BackoffPolicy, BackoffState};
pub use client::{ChannelStats, NotificationClient};
pub use config::{ChannelConfig, PollConfig};
pub use error::{ClientError, ConfigError, IdentityError, PollError, ProtocolError, TransportError};
pub use frame::{parse_frame, ControlKind, DomainEvent, InboundFrame, OutboundFrame, Priority};
pub use heartbeat::HeartbeatTicket;
pub use identity::{channel_address, ChannelIdentity};
pub use lifecycle::{ConnectionState, Generation, Lifecycle, Transition, Trigger};
pub use poll::{
    HttpStatusSource, PaymentStatusClassifier, PollOutcome, PollVerdict, StatusClassifier,
    StatusPoller, StatusSource,
};
pub use transport::{Connector, WsConnector};
pub use triage::{Notification, NotificationBuffer};
