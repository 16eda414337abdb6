//! Socket seam
//!
//! The transport only sees two channels: frames out, events in. Dropping the
//! outbound sender closes the socket.

use crate::errors::RelayError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    /// Protocol-level ping; the pong counts as inbound activity
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    /// Ping or pong from the server
    Activity,
    Closed { code: u16, reason: String },
}

pub struct SocketConnection {
    pub outbound: mpsc::UnboundedSender<SocketFrame>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SocketConnection, RelayError>;

    /// Connectivity check consulted before each reconnect attempt
    async fn is_online(&self) -> bool {
        true
    }
}

/// Websocket connector over tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SocketConnection, RelayError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut stream) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<SocketFrame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let message = match frame {
                    SocketFrame::Text(text) => Message::Text(text),
                    SocketFrame::Ping => Message::Ping(Vec::new()),
                };
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => SocketEvent::Text(text),
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => SocketEvent::Activity,
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (f.code.into(), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        let _ = inbound_tx.send(SocketEvent::Closed { code, reason });
                        return;
                    }
                    Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => {
                        trace!("ignoring non-text websocket frame");
                        continue;
                    }
                    Err(e) => {
                        let _ = inbound_tx.send(SocketEvent::Closed {
                            code: 1006,
                            reason: e.to_string(),
                        });
                        return;
                    }
                };
                if inbound_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(SocketEvent::Closed {
                code: 1006,
                reason: "stream ended".to_string(),
            });
        });

        Ok(SocketConnection { outbound, inbound })
    }
}
