use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, trace};
use url::Url;

use super::{CloseReason, Connector, Link, LinkCommand, LinkEvent};
use crate::error::TransportError;

/// How long the writer may spend flushing a close frame to a dead socket.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, address: &Url) -> Result<Link, TransportError> {
        let (ws_stream, response) = connect_async(address.as_str())
            .await
            .map_err(map_connect_error)?;
        debug!(
            target = "opsdeck::transport",
            address = %address,
            status = %response.status(),
            "websocket connected"
        );

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<LinkCommand>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();
        let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        // Writer: ends on an explicit close or once the link sender is dropped.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    Some(payload) = pong_rx.recv() => {
                        if ws_sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    command = out_rx.recv() => match command {
                        Some(LinkCommand::Text(text)) => {
                            if let Err(err) = ws_sender.send(Message::Text(text)).await {
                                debug!(target = "opsdeck::transport", error = %err, "websocket send failed");
                                break;
                            }
                        }
                        Some(LinkCommand::Close) | None => {
                            let _ = timeout(CLOSE_FLUSH_TIMEOUT, ws_sender.send(Message::Close(None))).await;
                            break;
                        }
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_receiver.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(LinkEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let text = String::from_utf8_lossy(&data).into_owned();
                        if in_tx.send(LinkEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        trace!(target = "opsdeck::transport", "answering websocket ping");
                        let _ = pong_tx.send(payload);
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => CloseReason::Remote {
                                code: u16::from(frame.code),
                                reason: frame.reason.into_owned(),
                            },
                            None => CloseReason::Ended,
                        };
                    }
                    Some(Err(err)) => {
                        break CloseReason::Error(TransportError::WebSocket(err.to_string()));
                    }
                    None => break CloseReason::Ended,
                }
            };
            let _ = in_tx.send(LinkEvent::Closed(reason));
        });

        Ok(Link::new(out_tx, in_rx).with_reader(reader))
    }
}

fn map_connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Io(io) => TransportError::Refused(io.to_string()),
        tungstenite::Error::Http(response) => {
            TransportError::Refused(format!("http {}", response.status()))
        }
        tungstenite::Error::Url(url) => TransportError::Refused(url.to_string()),
        other => TransportError::WebSocket(other.to_string()),
    }
}
