use std::time::Duration;

use thiserror::Error;

/// Failures of the underlying channel transport. Always recovered by the
/// reconnect loop; consumers only ever see them as a state change.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("link closed")]
    LinkClosed,
}

/// A frame that could not be turned into an `InboundFrame`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame is missing a type")]
    MissingType,
    #[error("frame of {len} bytes exceeds limit of {limit}")]
    Oversized { len: usize, limit: usize },
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("subject id must not be empty")]
    EmptySubject,
    #[error("role must not be empty")]
    EmptyRole,
    #[error("server url cannot carry a channel path: {0}")]
    UnsupportedBase(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error("notification channel task is not running")]
    ActorStopped,
    #[error("channel did not reach idle within {0:?}")]
    CloseTimedOut(Duration),
}

/// Request-level failures of a single status poll. The poller treats every
/// one of these as an inconclusive attempt.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid status url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
