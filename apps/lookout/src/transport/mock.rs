//! In-process relay used by tests: every `connect` hands the test a
//! [`MockRelay`] representing the server end of that socket.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_proto::SignalEnvelope;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use url::Url;

use super::{RelayConnection, RelayConnector, TransportError};

#[derive(Default)]
struct ConnectorState {
    attempts: usize,
    failures_remaining: usize,
    urls: Vec<Url>,
}

#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    relays_tx: mpsc::UnboundedSender<MockRelay>,
    relays_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<MockRelay>>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        let (relays_tx, relays_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(ConnectorState::default())),
            relays_tx,
            relays_rx: Arc::new(AsyncMutex::new(relays_rx)),
        }
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().failures_remaining = count;
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    pub fn urls(&self) -> Vec<Url> {
        self.state.lock().urls.clone()
    }

    /// Waits for the server end of the next successful connection.
    pub async fn next_relay(&self) -> Option<MockRelay> {
        self.relays_rx.lock().await.recv().await
    }

    pub fn try_next_relay(&self) -> Option<MockRelay> {
        self.relays_rx.try_lock().ok()?.try_recv().ok()
    }
}

#[async_trait]
impl RelayConnector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<RelayConnection, TransportError> {
        {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.urls.push(url.clone());
            if state.failures_remaining > 0 {
                state.failures_remaining -= 1;
                return Err(TransportError::Setup("mock relay refused connection".into()));
            }
        }

        let (client_out_tx, client_out_rx) = mpsc::unbounded_channel();
        let (client_in_tx, client_in_rx) = mpsc::unbounded_channel();
        let relay = MockRelay {
            to_client: Some(client_in_tx),
            from_client: client_out_rx,
        };
        self.relays_tx
            .send(relay)
            .map_err(|_| TransportError::ChannelClosed)?;
        Ok(RelayConnection {
            outbound: client_out_tx,
            inbound: client_in_rx,
        })
    }
}

/// Server side of one mock relay socket.
pub struct MockRelay {
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MockRelay {
    pub fn push(&self, text: impl Into<String>) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(text.into());
        }
    }

    pub fn push_envelope(&self, envelope: &SignalEnvelope) {
        if let Ok(text) = envelope.to_text() {
            self.push(text);
        }
    }

    pub async fn next_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub async fn next_envelope(&mut self) -> Option<SignalEnvelope> {
        let text = self.next_text().await?;
        serde_json::from_str(&text).ok()
    }

    pub fn try_next_envelope(&mut self) -> Option<SignalEnvelope> {
        let text = self.from_client.try_recv().ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Drops the relay side of the socket; the client observes a close.
    pub fn close(&mut self) {
        self.to_client = None;
    }
}
