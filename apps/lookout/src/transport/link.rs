use std::sync::Arc;
use std::time::Duration;

use relay_proto::SignalEnvelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use super::{RelayConnection, RelayConnector, TransportError};

/// Raw notifications posted by the connection task. Each carries the
/// generation of the attempt that produced it so events from a superseded
/// socket can be discarded.
#[derive(Debug)]
pub enum LinkEvent {
    Opened {
        generation: u64,
        outbound: mpsc::UnboundedSender<String>,
    },
    Message {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        reason: String,
    },
}

impl LinkEvent {
    pub fn generation(&self) -> u64 {
        match self {
            LinkEvent::Opened { generation, .. }
            | LinkEvent::Message { generation, .. }
            | LinkEvent::Closed { generation, .. } => *generation,
        }
    }
}

/// What the runtime needs to act on after the link absorbed an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkUpdate {
    Opened,
    Message(String),
    Closed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Not connected; a reconnect may be pending.
    Idle,
    Connecting,
    Open,
    /// Explicitly stopped. No further reconnects.
    Shutdown,
}

/// Single-shot fixed delay timer. At most one deadline is outstanding.
#[derive(Debug)]
pub struct ReconnectTimer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl ReconnectTimer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arms the timer. Returns `false` when one is already pending.
    pub fn schedule(&mut self) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(Instant::now() + self.delay);
        true
    }

    /// Returns `true` if a pending deadline was dropped.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Clears the deadline and returns `true` once it has elapsed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Reconnecting relay connection.
///
/// The link never blocks: connection attempts run on a spawned task that
/// reports back through `events`, and the owner feeds those events to
/// [`TransportLink::accept`] from its own loop.
pub struct TransportLink {
    url: Url,
    connector: Arc<dyn RelayConnector>,
    events: mpsc::UnboundedSender<LinkEvent>,
    generation: u64,
    state: LinkState,
    outbound: Option<mpsc::UnboundedSender<String>>,
    timer: ReconnectTimer,
    task: Option<JoinHandle<()>>,
}

impl TransportLink {
    pub fn new(
        url: Url,
        connector: Arc<dyn RelayConnector>,
        reconnect_delay: Duration,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            url,
            connector,
            events,
            generation: 0,
            state: LinkState::Idle,
            outbound: None,
            timer: ReconnectTimer::new(reconnect_delay),
            task: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    pub fn reconnect_pending(&self) -> bool {
        self.timer.is_pending()
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Starts a fresh connection attempt, superseding any previous socket.
    pub fn connect(&mut self) -> u64 {
        if self.state == LinkState::Shutdown {
            tracing::debug!(target = "relay", "connect ignored after shutdown");
            return self.generation;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.outbound = None;
        self.generation += 1;
        self.state = LinkState::Connecting;

        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        let events = self.events.clone();
        tracing::debug!(target = "relay", url = %url, generation, "connecting to relay");
        self.task = Some(tokio::spawn(run_connection(
            connector, url, generation, events,
        )));
        generation
    }

    pub fn accept(&mut self, event: LinkEvent) -> Option<LinkUpdate> {
        if self.state == LinkState::Shutdown || event.generation() != self.generation {
            tracing::trace!(
                target = "relay",
                stale = event.generation(),
                current = self.generation,
                "dropping stale link event"
            );
            return None;
        }
        match event {
            LinkEvent::Opened { outbound, .. } => {
                self.outbound = Some(outbound);
                self.state = LinkState::Open;
                if self.timer.cancel() {
                    tracing::debug!(target = "relay", "pending reconnect cancelled");
                }
                tracing::info!(target = "relay", generation = self.generation, "relay link open");
                Some(LinkUpdate::Opened)
            }
            LinkEvent::Message { text, .. } => {
                tracing::trace!(target = "relay", event = "ws_in", len = text.len());
                Some(LinkUpdate::Message(text))
            }
            LinkEvent::Closed { reason, .. } => {
                self.outbound = None;
                self.task = None;
                self.state = LinkState::Idle;
                tracing::warn!(target = "relay", %reason, "relay link closed");
                self.schedule_reconnect();
                Some(LinkUpdate::Closed { reason })
            }
        }
    }

    /// Arms the reconnect timer. Returns `false` if one is already pending or
    /// the link was shut down.
    pub fn schedule_reconnect(&mut self) -> bool {
        if self.state == LinkState::Shutdown {
            return false;
        }
        let scheduled = self.timer.schedule();
        if scheduled {
            tracing::debug!(
                target = "relay",
                delay_ms = self.timer.delay().as_millis() as u64,
                "reconnect scheduled"
            );
        }
        scheduled
    }

    /// Starts the next attempt once the reconnect deadline has elapsed.
    pub fn on_reconnect_due(&mut self) -> Option<u64> {
        if !self.timer.take_due(Instant::now()) {
            return None;
        }
        Some(self.connect())
    }

    pub fn send(&self, envelope: &SignalEnvelope) -> Result<(), TransportError> {
        let outbound = match (&self.state, &self.outbound) {
            (LinkState::Open, Some(outbound)) => outbound,
            _ => return Err(TransportError::NotConnected),
        };
        let text = envelope.to_text()?;
        tracing::trace!(
            target = "relay",
            event = "ws_out",
            kind = envelope.kind().as_wire(),
            len = text.len()
        );
        outbound
            .send(text)
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub fn shutdown(&mut self) {
        self.state = LinkState::Shutdown;
        self.timer.cancel();
        self.outbound = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_connection(
    connector: Arc<dyn RelayConnector>,
    url: Url,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let RelayConnection {
        outbound,
        mut inbound,
    } = match connector.connect(&url).await {
        Ok(connection) => connection,
        Err(err) => {
            tracing::warn!(target = "relay", url = %url, error = %err, "relay connect failed");
            let _ = events.send(LinkEvent::Closed {
                generation,
                reason: err.to_string(),
            });
            return;
        }
    };

    if events
        .send(LinkEvent::Opened {
            generation,
            outbound,
        })
        .is_err()
    {
        return;
    }
    while let Some(text) = inbound.recv().await {
        if events.send(LinkEvent::Message { generation, text }).is_err() {
            return;
        }
    }
    let _ = events.send(LinkEvent::Closed {
        generation,
        reason: "relay closed the connection".into(),
    });
}
