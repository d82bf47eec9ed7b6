//! Scripted in-memory transport.
//!
//! Every `connect` call surfaces as a [`MockAttempt`] on the paired
//! [`MockServer`]; the test decides whether to accept or refuse it and then
//! drives the accepted [`MockPeer`] directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use super::{CloseReason, Connector, Link, LinkCommand, LinkEvent};
use crate::error::TransportError;

pub fn mock_transport() -> (MockConnector, MockServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let count = Arc::new(AtomicUsize::new(0));
    (
        MockConnector {
            attempts: tx,
            count: count.clone(),
        },
        MockServer {
            attempts: rx,
            count,
        },
    )
}

#[derive(Debug, Clone)]
pub struct MockConnector {
    attempts: mpsc::UnboundedSender<MockAttempt>,
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &Url) -> Result<Link, TransportError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        let (reply, response) = oneshot::channel();
        self.attempts
            .send(MockAttempt {
                address: address.clone(),
                reply,
            })
            .map_err(|_| TransportError::Refused("mock server dropped".into()))?;
        response
            .await
            .unwrap_or_else(|_| Err(TransportError::Refused("attempt abandoned".into())))
    }
}

#[derive(Debug)]
pub struct MockServer {
    attempts: mpsc::UnboundedReceiver<MockAttempt>,
    count: Arc<AtomicUsize>,
}

impl MockServer {
    pub async fn next_attempt(&mut self) -> Option<MockAttempt> {
        self.attempts.recv().await
    }

    pub fn try_next_attempt(&mut self) -> Option<MockAttempt> {
        self.attempts.try_recv().ok()
    }

    /// Total connect calls seen so far, answered or not.
    pub fn attempt_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct MockAttempt {
    address: Url,
    reply: oneshot::Sender<Result<Link, TransportError>>,
}

impl MockAttempt {
    pub fn address(&self) -> &Url {
        &self.address
    }

    pub fn accept(self) -> MockPeer {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let _ = self.reply.send(Ok(Link::new(out_tx, in_rx)));
        MockPeer {
            events: in_tx,
            commands: out_rx,
        }
    }

    pub fn refuse(self, reason: &str) {
        let _ = self
            .reply
            .send(Err(TransportError::Refused(reason.to_string())));
    }
}

/// Server side of an accepted mock link.
#[derive(Debug)]
pub struct MockPeer {
    events: mpsc::UnboundedSender<LinkEvent>,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
}

impl MockPeer {
    /// Returns false once the client has dropped the link.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.events.send(LinkEvent::Text(text.into())).is_ok()
    }

    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.events
            .send(LinkEvent::Closed(CloseReason::Remote {
                code,
                reason: reason.to_string(),
            }))
            .is_ok()
    }

    pub fn fail(&self, reason: &str) -> bool {
        self.events
            .send(LinkEvent::Closed(CloseReason::Error(
                TransportError::WebSocket(reason.to_string()),
            )))
            .is_ok()
    }

    /// Next command the client wrote; `None` once the link is dropped.
    pub async fn recv(&mut self) -> Option<LinkCommand> {
        self.commands.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LinkCommand> {
        self.commands.try_recv().ok()
    }

    pub fn is_dropped(&self) -> bool {
        self.events.is_closed()
    }
}
