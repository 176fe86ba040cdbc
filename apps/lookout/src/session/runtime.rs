use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::{SessionCommand, SessionHandle, Supervisor, UiEvent};
use crate::config::{ClientConfig, ConfigError};
use crate::peer::{MediaCapture, PeerFactory, SessionPeerEvent};
use crate::router;
use crate::transport::{LinkEvent, LinkUpdate, RelayConnector, TransportLink};

/// Spawns the session loop on the current Tokio runtime.
///
/// The loop is the only place session state is mutated: relay frames, peer
/// callbacks, UI commands, the reconnect deadline and the status poll are all
/// serialized through one `select!`.
pub fn start(
    config: ClientConfig,
    connector: Arc<dyn RelayConnector>,
    peers: Arc<dyn PeerFactory>,
    capture: Arc<dyn MediaCapture>,
) -> Result<(SessionHandle, mpsc::UnboundedReceiver<UiEvent>, JoinHandle<()>), ConfigError> {
    let url = config.relay_url()?;
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();

    let link = TransportLink::new(url, connector, config.reconnect_delay, link_tx);
    let status_interval = config.status_interval;
    let supervisor = Supervisor::new(config, peers, capture, peer_tx, ui_tx);

    let task = tokio::spawn(run(
        link,
        supervisor,
        link_rx,
        peer_rx,
        command_rx,
        status_interval,
    ));
    Ok((SessionHandle::new(command_tx), ui_rx, task))
}

async fn run(
    mut link: TransportLink,
    mut supervisor: Supervisor,
    mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    mut peer_events: mpsc::UnboundedReceiver<SessionPeerEvent>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    status_interval: Option<Duration>,
) {
    link.connect();
    supervisor.emit(UiEvent::Link(link.state()));

    let mut status = status_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let reconnect_at = link.reconnect_deadline();
        tokio::select! {
            biased;

            Some(event) = link_events.recv() => match link.accept(event) {
                Some(LinkUpdate::Opened) => {
                    supervisor.emit(UiEvent::Link(link.state()));
                    supervisor.on_link_open(&link).await;
                }
                Some(LinkUpdate::Message(text)) => {
                    let mut inbound = supervisor.inbound(&link);
                    router::dispatch(&text, &mut inbound).await;
                }
                Some(LinkUpdate::Closed { reason }) => {
                    supervisor.on_link_closed(&reason);
                    supervisor.emit(UiEvent::Link(link.state()));
                }
                None => {}
            },
            Some(event) = peer_events.recv() => {
                supervisor.on_peer_event(event, &link).await;
            }
            command = commands.recv() => match command {
                Some(SessionCommand::Shutdown) | None => break,
                Some(command) => supervisor.on_command(command, &link).await,
            },
            _ = reconnect_due(reconnect_at) => {
                if let Some(generation) = link.on_reconnect_due() {
                    tracing::debug!(target = "session", generation, "reconnecting to relay");
                    supervisor.emit(UiEvent::Link(link.state()));
                }
            }
            _ = next_tick(&mut status) => {
                supervisor.emit(UiEvent::Status(supervisor.status(link.state())));
            }
        }
    }

    supervisor.shutdown().await;
    link.shutdown();
    supervisor.emit(UiEvent::Link(link.state()));
    tracing::info!(target = "session", "session loop stopped");
}

async fn reconnect_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn next_tick(status: &mut Option<Interval>) {
    match status {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}
