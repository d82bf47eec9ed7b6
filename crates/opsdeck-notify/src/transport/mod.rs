//! Transport seam for the notification channel.
//!
//! A [`Connector`] turns a channel address into a [`Link`]: an outbound
//! command sender plus a stream of inbound [`LinkEvent`]s. The lifecycle
//! driver never touches sockets directly.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::error::TransportError;

pub mod mock;
pub mod websocket;

pub use websocket::WsConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Text(String),
    /// Request an orderly close; the link reports `Closed` once the peer agrees.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Remote { code: u16, reason: String },
    Ended,
    Error(TransportError),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Remote { code, reason } if reason.is_empty() => {
                write!(f, "closed by server ({code})")
            }
            CloseReason::Remote { code, reason } => write!(f, "closed by server ({code}): {reason}"),
            CloseReason::Ended => f.write_str("stream ended"),
            CloseReason::Error(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    /// Terminal; no further events follow.
    Closed(CloseReason),
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &Url) -> Result<Link, TransportError>;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for std::sync::Arc<C> {
    async fn connect(&self, address: &Url) -> Result<Link, TransportError> {
        (**self).connect(address).await
    }
}

/// An established connection.
#[derive(Debug)]
pub struct Link {
    sender: LinkSender,
    events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Link {
    pub fn new(
        outbound: mpsc::UnboundedSender<LinkCommand>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self {
            sender: LinkSender {
                outbound,
                reader: None,
            },
            events,
        }
    }

    /// Ties a background reader task to the link; it is aborted when the
    /// sending half is dropped.
    pub fn with_reader(mut self, task: JoinHandle<()>) -> Self {
        self.sender.reader = Some(task);
        self
    }

    pub fn into_parts(self) -> (LinkSender, mpsc::UnboundedReceiver<LinkEvent>) {
        (self.sender, self.events)
    }
}

/// Sending half of a link. Dropping it abandons the connection.
#[derive(Debug)]
pub struct LinkSender {
    outbound: mpsc::UnboundedSender<LinkCommand>,
    reader: Option<JoinHandle<()>>,
}

impl LinkSender {
    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(LinkCommand::Text(text))
            .map_err(|_| TransportError::LinkClosed)
    }

    pub fn close(&self) -> Result<(), TransportError> {
        self.outbound
            .send(LinkCommand::Close)
            .map_err(|_| TransportError::LinkClosed)
    }
}

impl Drop for LinkSender {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
