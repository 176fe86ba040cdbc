use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub mod link;
pub mod mock;
pub mod websocket;

pub use link::{LinkEvent, LinkState, LinkUpdate, ReconnectTimer, TransportLink};
pub use websocket::WsConnector;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay link is not connected")]
    NotConnected,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("transport timeout")]
    Timeout,
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An open duplex text connection to the relay.
///
/// Dropping `outbound` closes the write half; `inbound` yields `None` once the
/// relay side is gone.
pub struct RelayConnection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<RelayConnection, TransportError>;
}
