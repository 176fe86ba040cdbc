use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use url::Url;

use super::{RelayConnection, RelayConnector, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay connector over a WebSocket, one JSON envelope per text frame.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl RelayConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<RelayConnection, TransportError> {
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|err| TransportError::WebSocket(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "relay", url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_write.send(Message::Text(text)).await {
                    tracing::debug!(target = "relay", error = %err, "relay write failed");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!(target = "relay", "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(target = "relay", ?frame, "relay sent close");
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "relay", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "relay", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                if inbound_tx.send(text).is_err() {
                    break;
                }
            }
        });

        Ok(RelayConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
