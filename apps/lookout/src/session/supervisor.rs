use std::sync::Arc;

use async_trait::async_trait;
use relay_proto::{
    ChannelNotice, CommandArg, ConnectivityCandidate, ControlCatalog, ControlDescriptor,
    ControlValue, IceServer, IceServerList, RemoteCommand, RosterEntry, SessionDescriptor,
    SignalEnvelope, normalize_catalog,
};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{SessionCommand, SessionFlags, StatusSnapshot, UiEvent};
use crate::config::ClientConfig;
use crate::negotiation::{
    ConnectivityState, DescriptorOutcome, NegotiationStateMachine, SignalSink, Transition,
};
use crate::peer::{
    LocalMedia, MediaCapture, PeerEvent, PeerEventSink, PeerFactory, PeerNegotiator,
    PeerSessionConfig, SessionPeerEvent,
};
use crate::router::Dispatch;
use crate::transfer::{
    ReliableChannel, TransferJob, TransferProgress, TransferQueue, negotiated_max_message_size,
};
use crate::transport::{LinkState, TransportLink};

pub const RECORD_REFUSED_NOTICE: &str = "Recording thread is already running";

/// One negotiation unit. Never reused once torn down.
struct SessionContext {
    id: u64,
    peer: Arc<dyn PeerNegotiator>,
    nsm: NegotiationStateMachine,
    channel: Option<Arc<dyn ReliableChannel>>,
    channel_attached: bool,
    local_media: Vec<LocalMedia>,
}

impl SessionContext {
    fn stop_local_media(&mut self) -> bool {
        let had_media = !self.local_media.is_empty();
        for media in self.local_media.drain(..) {
            tracing::debug!(target = "session", session = self.id, label = media.label(), "stopping local media");
            media.stop();
        }
        had_media
    }
}

/// Owns the live peer session and everything that outlives it: the ICE
/// server registry, the transfer queue, the device control catalog and the
/// session flags.
pub struct Supervisor {
    config: ClientConfig,
    peers: Arc<dyn PeerFactory>,
    capture: Arc<dyn MediaCapture>,
    peer_events: mpsc::UnboundedSender<SessionPeerEvent>,
    ui: mpsc::UnboundedSender<UiEvent>,
    ice_servers: Vec<IceServer>,
    next_session: u64,
    session: Option<SessionContext>,
    transfers: TransferQueue,
    catalog: ControlCatalog,
    flags: SessionFlags,
}

impl Supervisor {
    pub fn new(
        config: ClientConfig,
        peers: Arc<dyn PeerFactory>,
        capture: Arc<dyn MediaCapture>,
        peer_events: mpsc::UnboundedSender<SessionPeerEvent>,
        ui: mpsc::UnboundedSender<UiEvent>,
    ) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            transfers: TransferQueue::new(config.transfer),
            config,
            peers,
            capture,
            peer_events,
            ui,
            next_session: 0,
            session: None,
            catalog: ControlCatalog::new(),
            flags: SessionFlags::default(),
        }
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|ctx| ctx.id)
    }

    pub fn connectivity(&self) -> Option<ConnectivityState> {
        self.session.as_ref().map(|ctx| ctx.nsm.state())
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn catalog(&self) -> &ControlCatalog {
        &self.catalog
    }

    pub fn emit(&self, event: UiEvent) {
        if self.ui.send(event).is_err() {
            tracing::trace!(target = "session", "ui receiver dropped");
        }
    }

    fn emit_all(&self, updates: Vec<TransferProgress>) {
        for update in updates {
            self.emit(UiEvent::Transfer(update));
        }
    }

    pub fn status(&self, link: LinkState) -> StatusSnapshot {
        StatusSnapshot {
            link,
            session: self.session_id(),
            connectivity: self.connectivity(),
            flags: self.flags,
            transfer: self.transfers.active(),
            queued_transfers: self.transfers.waiting(),
        }
    }

    /// Pairs the supervisor with the link for routing one inbound frame.
    pub fn inbound<'a>(&'a mut self, link: &'a TransportLink) -> Inbound<'a> {
        Inbound {
            supervisor: self,
            link,
        }
    }

    /// Every successful relay connection starts a brand-new peer session.
    pub async fn on_link_open(&mut self, link: &TransportLink) {
        self.teardown().await;

        self.next_session += 1;
        let id = self.next_session;
        let config = PeerSessionConfig {
            session: id,
            ice_servers: self.ice_servers.clone(),
            channel_label: self.config.channel_label.clone(),
            codec_preference: self.config.codec_preference,
        };
        let events = PeerEventSink::new(id, self.peer_events.clone());
        let peer = match self.peers.create(config, events).await {
            Ok(peer) => peer,
            Err(err) => {
                tracing::warn!(target = "session", session = id, error = %err, "could not create peer session");
                return;
            }
        };
        tracing::info!(target = "session", session = id, role = ?self.config.role, "peer session created");
        let mut ctx = SessionContext {
            id,
            peer,
            nsm: NegotiationStateMachine::new(id, self.config.role),
            channel: None,
            channel_attached: false,
            local_media: Vec::new(),
        };
        self.emit(UiEvent::Connectivity {
            session: id,
            state: ctx.nsm.state(),
        });

        if ctx.nsm.should_initiate() {
            let before = ctx.nsm.state();
            if let Err(err) = ctx.nsm.initiate(ctx.peer.as_ref(), link).await {
                tracing::warn!(target = "session", session = id, error = %err, "initial offer failed");
            }
            if ctx.nsm.state() != before {
                self.emit(UiEvent::Connectivity {
                    session: id,
                    state: ctx.nsm.state(),
                });
            }
        }
        self.session = Some(ctx);
    }

    pub fn on_link_closed(&mut self, reason: &str) {
        tracing::debug!(
            target = "session",
            session = ?self.session_id(),
            %reason,
            "relay lost; session kept until the relay reopens"
        );
    }

    pub async fn on_peer_event(&mut self, event: SessionPeerEvent, link: &TransportLink) {
        let SessionPeerEvent { session, event } = event;
        if self.session_id() != Some(session) {
            tracing::trace!(target = "session", stale = session, current = ?self.session_id(), ?event, "dropping event from a discarded session");
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(err) = link.transmit(&SignalEnvelope::candidate(candidate)) {
                    tracing::debug!(target = "session", session, error = %err, "local candidate not sent");
                }
            }
            PeerEvent::Connectivity(reported) => {
                let Some(ctx) = self.session.as_mut() else {
                    return;
                };
                if let Some(transition) = ctx.nsm.on_connectivity(ctx.peer.as_ref(), link, reported).await {
                    self.on_transition(transition).await;
                }
            }
            PeerEvent::ChannelOpen(channel) => {
                if channel.label() != self.config.channel_label {
                    tracing::debug!(target = "session", session, label = channel.label(), "ignoring foreign channel");
                    return;
                }
                if let Some(ctx) = self.session.as_mut() {
                    tracing::debug!(target = "session", session, label = channel.label(), "reliable channel open");
                    ctx.channel = Some(channel);
                }
                self.attach_channel_if_ready().await;
            }
            PeerEvent::ChannelText(text) => self.on_channel_text(&text),
            PeerEvent::ChannelBinary(data) => {
                tracing::trace!(target = "session", session, len = data.len(), "ignoring binary frame from device");
            }
            PeerEvent::ChannelClosed { label } => {
                if label != self.config.channel_label {
                    tracing::debug!(target = "session", session, %label, "foreign channel closed");
                    return;
                }
                if let Some(ctx) = self.session.as_mut() {
                    ctx.channel = None;
                    ctx.channel_attached = false;
                }
                let updates = self.transfers.on_channel_closed();
                self.emit_all(updates);
            }
            PeerEvent::BufferedAmountLow { label } if label == self.config.channel_label => {
                let updates = self.transfers.on_buffered_amount_low().await;
                self.emit_all(updates);
            }
            PeerEvent::BufferedAmountLow { .. } => {}
            PeerEvent::RemoteTrack { kind, id } => {
                tracing::debug!(target = "session", session, %kind, %id, "remote track");
                self.emit(UiEvent::RemoteTrack { kind, id });
            }
        }
    }

    async fn on_transition(&mut self, transition: Transition) {
        let Some(id) = self.session_id() else {
            return;
        };
        tracing::info!(target = "session", session = id, from = ?transition.from, to = ?transition.to, "connectivity changed");
        self.emit(UiEvent::Connectivity {
            session: id,
            state: transition.to,
        });
        match transition.to {
            ConnectivityState::Connected => self.attach_channel_if_ready().await,
            ConnectivityState::Disconnected | ConnectivityState::Failed => {
                self.release_outbound().await;
            }
            ConnectivityState::Closed => self.teardown().await,
            ConnectivityState::New | ConnectivityState::Connecting => {}
        }
    }

    /// Hands the channel to the transfer queue once it is open and the
    /// session is connected, whichever happens last.
    async fn attach_channel_if_ready(&mut self) {
        let Some(ctx) = self.session.as_mut() else {
            return;
        };
        if ctx.channel_attached || ctx.nsm.state() != ConnectivityState::Connected {
            return;
        }
        let Some(channel) = ctx.channel.clone() else {
            return;
        };
        let max_message_size = ctx
            .nsm
            .remote_descriptor()
            .map(|remote| {
                negotiated_max_message_size(remote.body(), self.config.transfer.local_max_message_size)
            })
            .unwrap_or(self.config.transfer.local_max_message_size);
        ctx.channel_attached = true;
        let updates = self.transfers.attach(channel, max_message_size).await;
        self.emit_all(updates);
    }

    /// Stops local media and releases every sender and transceiver bound to
    /// the session.
    async fn release_outbound(&mut self) {
        let Some(ctx) = self.session.as_mut() else {
            return;
        };
        ctx.stop_local_media();
        match ctx.peer.release_outbound().await {
            Ok(released) => tracing::debug!(target = "session", session = ctx.id, released, "outbound media released"),
            Err(err) => tracing::warn!(target = "session", session = ctx.id, error = %err, "releasing outbound media failed"),
        }
        self.flags.talking = false;
        self.emit(UiEvent::LocalMedia { sending: false });
    }

    /// Closes and discards the current session, if any.
    pub async fn teardown(&mut self) {
        let Some(mut ctx) = self.session.take() else {
            return;
        };
        let had_media = ctx.stop_local_media();
        if let Err(err) = ctx.peer.release_outbound().await {
            tracing::debug!(target = "session", session = ctx.id, error = %err, "release on teardown failed");
        }
        if let Some(channel) = ctx.channel.take() {
            channel.close().await;
        }
        let updates = self.transfers.on_channel_closed();
        self.emit_all(updates);

        if ctx.nsm.stop(ctx.peer.as_ref()).await.is_some() {
            self.emit(UiEvent::Connectivity {
                session: ctx.id,
                state: ConnectivityState::Closed,
            });
        }
        if had_media || self.flags.talking {
            self.flags.talking = false;
            self.emit(UiEvent::LocalMedia { sending: false });
        }
        tracing::info!(target = "session", session = ctx.id, "peer session closed");
    }

    pub async fn shutdown(&mut self) {
        self.teardown().await;
        self.flags = SessionFlags::default();
    }

    pub async fn on_command(&mut self, command: SessionCommand, link: &TransportLink) {
        match command {
            SessionCommand::Offer => self.offer(link).await,
            SessionCommand::Record(start) => self.record(start, link),
            SessionCommand::Talk(start) => self.talk(start, link).await,
            SessionCommand::SendClip { name, mime, data } => match TransferJob::new(name, mime, data) {
                Ok(job) => {
                    let updates = self.transfers.enqueue(job).await;
                    self.emit_all(updates);
                }
                Err(err) => {
                    tracing::warn!(target = "session", error = %err, "clip rejected");
                    self.emit(UiEvent::Notice(err.to_string()));
                }
            },
            SessionCommand::SetControl { name, value } => {
                self.send_control(&name, |descriptor| {
                    if descriptor.is_toggle() {
                        ControlDescriptor::toggle_value(value != 0)
                    } else {
                        descriptor.device_value(value)
                    }
                }, link);
            }
            SessionCommand::ToggleControl { name, checked } => {
                self.send_control(&name, |_| ControlDescriptor::toggle_value(checked), link);
            }
            SessionCommand::ResetControls => {
                if let Err(err) = link.transmit(&SignalEnvelope::reset_controls()) {
                    tracing::warn!(target = "session", error = %err, "control reset not sent");
                }
            }
            SessionCommand::Status => self.emit(UiEvent::Status(self.status(link.state()))),
            SessionCommand::Stop => {
                self.teardown().await;
                self.flags = SessionFlags::default();
            }
            SessionCommand::Shutdown => self.shutdown().await,
        }
    }

    async fn offer(&mut self, link: &TransportLink) {
        let Some(ctx) = self.session.as_mut() else {
            tracing::warn!(target = "session", "offer requested without a session");
            return;
        };
        let before = ctx.nsm.state();
        if let Err(err) = ctx.nsm.initiate(ctx.peer.as_ref(), link).await {
            tracing::warn!(target = "session", session = ctx.id, error = %err, "offer failed");
        }
        let (id, after) = (ctx.id, ctx.nsm.state());
        if after != before {
            self.emit(UiEvent::Connectivity { session: id, state: after });
        }
    }

    fn record(&mut self, start: bool, link: &TransportLink) {
        if !self.config.recording {
            tracing::warn!(target = "session", "recording is disabled");
            return;
        }
        if self.flags.recording == start {
            tracing::debug!(target = "session", start, "record flag already set");
            return;
        }
        match link.transmit(&SignalEnvelope::command(RemoteCommand::Record, start)) {
            Ok(()) => self.flags.recording = start,
            Err(err) => tracing::warn!(target = "session", error = %err, "record command not sent"),
        }
    }

    async fn talk(&mut self, start: bool, link: &TransportLink) {
        let Some(ctx) = self.session.as_mut() else {
            tracing::warn!(target = "session", "talk requested without a session");
            return;
        };

        if !start {
            if !self.flags.talking {
                return;
            }
            ctx.stop_local_media();
            self.flags.talking = false;
            if let Err(err) = link.transmit(&SignalEnvelope::command(RemoteCommand::Talk, false)) {
                tracing::warn!(target = "session", error = %err, "talk stop not sent");
            }
            self.emit(UiEvent::LocalMedia { sending: false });
            return;
        }

        if !self.config.talk_back {
            tracing::warn!(target = "session", "talk-back is disabled");
            return;
        }
        if self.flags.talking
            || ctx.nsm.state() != ConnectivityState::Connected
            || ctx.nsm.awaiting_answer()
        {
            tracing::warn!(
                target = "session",
                session = ctx.id,
                talking = self.flags.talking,
                state = ?ctx.nsm.state(),
                awaiting_answer = ctx.nsm.awaiting_answer(),
                "talk not allowed now"
            );
            return;
        }

        let media = match self.capture.acquire().await {
            Ok(media) => media,
            Err(err) => {
                tracing::warn!(target = "session", error = %err, "could not acquire local media");
                return;
            }
        };
        if let Err(err) = ctx.peer.attach_media(&media).await {
            tracing::warn!(target = "session", session = ctx.id, error = %err, "could not attach local media");
            media.stop();
            return;
        }
        ctx.local_media.push(media);
        if let Err(err) = link.transmit(&SignalEnvelope::command(RemoteCommand::Talk, true)) {
            tracing::warn!(target = "session", error = %err, "talk start not sent");
        }
        if let Err(err) = ctx.nsm.initiate(ctx.peer.as_ref(), link).await {
            tracing::warn!(target = "session", session = ctx.id, error = %err, "renegotiation after talk start failed");
            ctx.stop_local_media();
            if let Err(err) = link.transmit(&SignalEnvelope::command(RemoteCommand::Talk, false)) {
                tracing::warn!(target = "session", error = %err, "talk stop not sent");
            }
            return;
        }
        self.flags.talking = true;
        self.emit(UiEvent::LocalMedia { sending: true });
    }

    fn send_control<F>(&self, name: &str, device_value: F, link: &TransportLink)
    where
        F: FnOnce(&ControlDescriptor) -> i64,
    {
        let Some(descriptor) = self.catalog.get(name) else {
            tracing::warn!(target = "session", control = name, "unknown device control");
            return;
        };
        let value = device_value(descriptor);
        if let Err(err) = link.transmit(&SignalEnvelope::set_control(descriptor.id, value)) {
            tracing::warn!(target = "session", control = name, error = %err, "control change not sent");
        }
    }

    fn on_channel_text(&mut self, text: &str) {
        match ChannelNotice::parse(text) {
            Ok(notices) => {
                for notice in notices {
                    match notice {
                        ChannelNotice::Notify(message) => self.emit(UiEvent::Notice(message)),
                        ChannelNotice::Catalog(catalog) => self.replace_catalog(catalog),
                    }
                }
            }
            Err(err) => {
                tracing::warn!(target = "session", error = %err, "dropping channel text");
            }
        }
    }

    fn replace_catalog(&mut self, catalog: ControlCatalog) {
        self.catalog = normalize_catalog(&catalog);
        tracing::debug!(target = "session", controls = self.catalog.len(), "device control catalog updated");
        self.emit(UiEvent::Catalog(self.catalog.clone()));
    }
}

/// Routing target for one inbound relay frame.
pub struct Inbound<'a> {
    supervisor: &'a mut Supervisor,
    link: &'a TransportLink,
}

#[async_trait]
impl Dispatch for Inbound<'_> {
    async fn on_remote_descriptor(&mut self, descriptor: SessionDescriptor) {
        let link = self.link;
        let supervisor = &mut *self.supervisor;
        let Some(ctx) = supervisor.session.as_mut() else {
            tracing::warn!(target = "session", "remote descriptor without a session");
            return;
        };
        let before = ctx.nsm.state();
        match ctx.nsm.on_remote_descriptor(ctx.peer.as_ref(), link, descriptor).await {
            Ok(DescriptorOutcome::Duplicate) => {}
            Ok(outcome) => {
                tracing::debug!(target = "session", session = ctx.id, ?outcome, "remote descriptor applied");
            }
            Err(err) => {
                tracing::warn!(target = "session", session = ctx.id, error = %err, "remote descriptor rejected");
            }
        }
        let (id, after) = (ctx.id, ctx.nsm.state());
        if after != before {
            supervisor.emit(UiEvent::Connectivity { session: id, state: after });
        }
    }

    async fn on_remote_candidate(&mut self, candidate: ConnectivityCandidate) {
        let Some(ctx) = self.supervisor.session.as_mut() else {
            tracing::debug!(target = "session", "remote candidate without a session");
            return;
        };
        if let Err(err) = ctx.nsm.on_remote_candidate(ctx.peer.as_ref(), candidate).await {
            tracing::warn!(target = "session", session = ctx.id, error = %err, "remote candidate rejected");
        }
    }

    fn on_ice_servers(&mut self, servers: IceServerList) {
        let servers = servers.into_servers();
        tracing::debug!(target = "session", count = servers.len(), "ice servers updated for the next session");
        self.supervisor.ice_servers = servers;
    }

    fn on_device_control(&mut self, value: Option<ControlValue>, reset: bool) {
        let updated = value.and_then(|ControlValue { id, value: device }| {
            let descriptor = self
                .supervisor
                .catalog
                .values_mut()
                .find(|descriptor| descriptor.id == id)?;
            descriptor.value = Some(device + descriptor.offset);
            Some(id)
        });
        tracing::trace!(target = "session", ?updated, reset, "remote device control");
        self.supervisor.emit(UiEvent::DeviceControl { value, reset });
    }

    fn on_remote_command(&mut self, cmd: RemoteCommand, arg: CommandArg) {
        if cmd == RemoteCommand::Record {
            self.supervisor.flags.recording = arg == CommandArg::Start;
        }
        self.supervisor.emit(UiEvent::RemoteCommand { cmd, arg });
    }

    fn on_record_refused(&mut self, detail: Value) {
        tracing::info!(target = "session", %detail, "remote refused to start recording");
        self.supervisor.flags.recording = false;
        self.supervisor
            .emit(UiEvent::Notice(RECORD_REFUSED_NOTICE.to_owned()));
    }

    fn on_roster(&mut self, roster: Vec<RosterEntry>) {
        self.supervisor.emit(UiEvent::Roster(roster));
    }

    fn on_control_catalog(&mut self, catalog: ControlCatalog) {
        self.supervisor.replace_catalog(catalog);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::{MockCapture, MockChannel, MockPeerFactory, NegotiatorCall};
    use crate::router::{Routed, dispatch};
    use crate::transfer::TransferState;
    use crate::transport::LinkEvent;
    use crate::transport::mock::{MockConnector, MockRelay};
    use relay_proto::DescriptorRole;
    use std::time::Duration;
    use url::Url;

    struct Harness {
        supervisor: Supervisor,
        link: TransportLink,
        link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        peer_rx: mpsc::UnboundedReceiver<SessionPeerEvent>,
        ui_rx: mpsc::UnboundedReceiver<UiEvent>,
        peers: MockPeerFactory,
        capture: MockCapture,
        connector: MockConnector,
    }

    impl Harness {
        fn new(config: ClientConfig) -> Self {
            let connector = MockConnector::new();
            let peers = MockPeerFactory::new();
            let capture = MockCapture::new();
            let (link_tx, link_rx) = mpsc::unbounded_channel();
            let (peer_tx, peer_rx) = mpsc::unbounded_channel();
            let (ui_tx, ui_rx) = mpsc::unbounded_channel();
            let link = TransportLink::new(
                Url::parse("wss://relay.test/ws").unwrap(),
                Arc::new(connector.clone()),
                Duration::from_secs(5),
                link_tx,
            );
            let supervisor = Supervisor::new(
                config,
                Arc::new(peers.clone()),
                Arc::new(capture.clone()),
                peer_tx,
                ui_tx,
            );
            Self {
                supervisor,
                link,
                link_rx,
                peer_rx,
                ui_rx,
                peers,
                capture,
                connector,
            }
        }

        /// Connects the link and starts a session, returning the relay end.
        async fn open(&mut self) -> MockRelay {
            self.link.connect();
            let relay = self.connector.next_relay().await.unwrap();
            let event = self.link_rx.recv().await.unwrap();
            self.link.accept(event);
            assert!(self.link.is_open());
            self.supervisor.on_link_open(&self.link).await;
            relay
        }

        async fn route(&mut self, raw: &str) -> Routed {
            let mut inbound = self.supervisor.inbound(&self.link);
            dispatch(raw, &mut inbound).await
        }

        async fn pump_peer_events(&mut self) {
            while let Ok(event) = self.peer_rx.try_recv() {
                self.supervisor.on_peer_event(event, &self.link).await;
            }
        }

        fn ui_events(&mut self) -> Vec<UiEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.ui_rx.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn offer_frame() -> String {
        SignalEnvelope::descriptor(SessionDescriptor::offer("v=0\r\na=max-message-size:20000\r\n"))
            .to_text()
            .unwrap()
    }

    #[tokio::test]
    async fn remote_offer_is_answered_over_the_relay() {
        let mut harness = Harness::new(ClientConfig::default());
        let mut relay = harness.open().await;

        assert_eq!(harness.route(&offer_frame()).await, Routed::Dispatched);
        let Some(SignalEnvelope::SessionDescription { data }) = relay.next_envelope().await else {
            panic!("expected an answer");
        };
        assert_eq!(data.role, DescriptorRole::Answer);
        assert_eq!(harness.supervisor.connectivity(), Some(ConnectivityState::Connecting));
        assert!(harness.ui_events().contains(&UiEvent::Connectivity {
            session: 1,
            state: ConnectivityState::Connecting,
        }));
    }

    #[tokio::test]
    async fn record_refusal_clears_flag_and_notifies() {
        let mut harness = Harness::new(ClientConfig::default());
        let mut relay = harness.open().await;

        harness.supervisor.on_command(SessionCommand::Record(true), &harness.link).await;
        assert!(harness.supervisor.flags().recording);
        assert_eq!(
            relay.next_envelope().await,
            Some(SignalEnvelope::command(RemoteCommand::Record, true))
        );

        harness.route(r#"{"type":"record","data":"already running"}"#).await;
        assert!(!harness.supervisor.flags().recording);
        assert!(
            harness
                .ui_events()
                .contains(&UiEvent::Notice(RECORD_REFUSED_NOTICE.into()))
        );
    }

    #[tokio::test]
    async fn ice_servers_apply_to_the_next_session_only() {
        let mut harness = Harness::new(ClientConfig::default());
        let _relay = harness.open().await;
        harness
            .route(r#"{"type":"iceServers","iceServers":{"iceServers":[{"urls":["turn:10.0.0.1"],"username":"u","credential":"p"}]}}"#)
            .await;

        let first = harness.peers.latest().unwrap();
        assert_eq!(first.config.ice_servers[0].urls.to_vec(), vec!["stun:stun.l.google.com:19302"]);

        harness.supervisor.on_link_open(&harness.link).await;
        let second = harness.peers.latest().unwrap();
        assert_eq!(second.session(), 2);
        assert_eq!(second.config.ice_servers[0].username.as_deref(), Some("u"));
        assert!(first.negotiator.is_closed());
    }

    #[tokio::test]
    async fn failure_releases_local_media() {
        let mut harness = Harness::new(ClientConfig::default());
        let mut relay = harness.open().await;
        harness.route(&offer_frame()).await;
        let _answer = relay.next_envelope().await;

        let peer = harness.peers.latest().unwrap();
        peer.report(ConnectivityState::Connected);
        harness.pump_peer_events().await;

        harness.supervisor.on_command(SessionCommand::Talk(true), &harness.link).await;
        assert!(harness.supervisor.flags().talking);
        assert_eq!(peer.negotiator.attached_media(), vec!["microphone-1"]);
        assert_eq!(
            relay.next_envelope().await,
            Some(SignalEnvelope::command(RemoteCommand::Talk, true))
        );
        let Some(SignalEnvelope::SessionDescription { data }) = relay.next_envelope().await else {
            panic!("expected a renegotiation offer");
        };
        assert_eq!(data.role, DescriptorRole::Offer);

        peer.report(ConnectivityState::Disconnected);
        harness.pump_peer_events().await;
        assert!(!harness.supervisor.flags().talking);
        assert!(harness.capture.sources()[0].is_stopped());
        assert!(peer.negotiator.calls().contains(&NegotiatorCall::ReleaseOutbound));
        assert!(
            harness
                .ui_events()
                .contains(&UiEvent::LocalMedia { sending: false })
        );
    }

    #[tokio::test]
    async fn talk_waits_for_an_outstanding_offer() {
        let mut harness = Harness::new(ClientConfig::default());
        let mut relay = harness.open().await;
        harness.route(&offer_frame()).await;
        let _answer = relay.next_envelope().await;
        let peer = harness.peers.latest().unwrap();
        peer.report(ConnectivityState::Connected);
        harness.pump_peer_events().await;

        harness.supervisor.on_command(SessionCommand::Offer, &harness.link).await;
        let Some(SignalEnvelope::SessionDescription { data }) = relay.next_envelope().await else {
            panic!("expected a local offer");
        };
        assert_eq!(data.role, DescriptorRole::Offer);
        harness.ui_events();

        harness.supervisor.on_command(SessionCommand::Talk(true), &harness.link).await;
        assert!(!harness.supervisor.flags().talking);
        assert!(harness.capture.sources().is_empty());
        assert!(peer.negotiator.attached_media().is_empty());
        assert!(
            !harness
                .ui_events()
                .contains(&UiEvent::LocalMedia { sending: true })
        );
    }

    #[tokio::test]
    async fn failed_renegotiation_rolls_talk_back() {
        let mut harness = Harness::new(ClientConfig::default());
        let mut relay = harness.open().await;
        harness.route(&offer_frame()).await;
        let _answer = relay.next_envelope().await;
        let peer = harness.peers.latest().unwrap();
        peer.report(ConnectivityState::Connected);
        harness.pump_peer_events().await;
        harness.ui_events();

        peer.negotiator.reject_offers(true);
        harness.supervisor.on_command(SessionCommand::Talk(true), &harness.link).await;
        assert!(!harness.supervisor.flags().talking);
        assert!(harness.capture.sources()[0].is_stopped());
        assert_eq!(
            relay.next_envelope().await,
            Some(SignalEnvelope::command(RemoteCommand::Talk, true))
        );
        assert_eq!(
            relay.next_envelope().await,
            Some(SignalEnvelope::command(RemoteCommand::Talk, false))
        );
        assert!(
            !harness
                .ui_events()
                .contains(&UiEvent::LocalMedia { sending: true })
        );
    }

    #[tokio::test]
    async fn channel_waits_for_connected_before_transfers_start() {
        let mut harness = Harness::new(ClientConfig::default());
        let mut relay = harness.open().await;
        harness.route(&offer_frame()).await;
        let _answer = relay.next_envelope().await;

        let peer = harness.peers.latest().unwrap();
        let channel = MockChannel::new("web page channel");
        peer.open_channel(&channel);
        harness
            .supervisor
            .on_command(
                SessionCommand::SendClip {
                    name: "clip.ogg".into(),
                    mime: "audio/ogg".into(),
                    data: vec![7u8; 50_000].into(),
                },
                &harness.link,
            )
            .await;
        harness.pump_peer_events().await;
        assert!(channel.frames().is_empty());

        peer.report(ConnectivityState::Connected);
        harness.pump_peer_events().await;
        let chunks = channel.binary_frames();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 50_000);
        assert_eq!(chunks[3].len(), 50_000 - 3 * 16_384);
    }

    #[tokio::test]
    async fn foreign_channel_close_leaves_the_transfer_running() {
        let mut config = ClientConfig::default();
        config.transfer.max_buffered = 32_768;
        let mut harness = Harness::new(config);
        let mut relay = harness.open().await;
        harness.route(&offer_frame()).await;
        let _answer = relay.next_envelope().await;

        let peer = harness.peers.latest().unwrap();
        let channel = MockChannel::new("web page channel");
        peer.open_channel(&channel);
        peer.report(ConnectivityState::Connected);
        harness.pump_peer_events().await;
        harness
            .supervisor
            .on_command(
                SessionCommand::SendClip {
                    name: "clip.webm".into(),
                    mime: "video/webm".into(),
                    data: vec![3u8; 100_000].into(),
                },
                &harness.link,
            )
            .await;
        let paused = channel.binary_frames().len();
        assert_eq!(paused, 2);

        let other = MockChannel::new("telemetry");
        peer.open_channel(&other);
        other.close_now();
        harness.pump_peer_events().await;
        assert!(!harness.ui_events().iter().any(|event| matches!(
            event,
            UiEvent::Transfer(progress) if matches!(progress.state, TransferState::Failed(_))
        )));

        channel.drain(usize::MAX);
        harness.pump_peer_events().await;
        assert!(channel.binary_frames().len() > paused);
        assert!(other.frames().is_empty());
    }

    #[tokio::test]
    async fn controls_are_sent_in_the_device_range() {
        let mut harness = Harness::new(ClientConfig::default());
        let mut relay = harness.open().await;
        harness
            .route(r#"{"type":"status","ctrls":{"Contrast":{"id":42,"min":-10,"max":10,"type":1,"value":0},"Flip":{"id":43,"min":0,"max":1,"type":2}}}"#)
            .await;
        assert_eq!(harness.supervisor.catalog()["Contrast"].max, 20);

        harness
            .supervisor
            .on_command(SessionCommand::SetControl { name: "Contrast".into(), value: 12 }, &harness.link)
            .await;
        harness
            .supervisor
            .on_command(SessionCommand::ToggleControl { name: "Flip".into(), checked: true }, &harness.link)
            .await;
        harness
            .supervisor
            .on_command(SessionCommand::SetControl { name: "Missing".into(), value: 1 }, &harness.link)
            .await;
        harness.supervisor.on_command(SessionCommand::ResetControls, &harness.link).await;

        assert_eq!(relay.next_envelope().await, Some(SignalEnvelope::set_control(42, 2)));
        assert_eq!(relay.next_envelope().await, Some(SignalEnvelope::set_control(43, 1)));
        assert_eq!(relay.next_envelope().await, Some(SignalEnvelope::reset_controls()));
    }

    #[tokio::test]
    async fn channel_notices_reach_the_ui() {
        let mut harness = Harness::new(ClientConfig::default());
        let _relay = harness.open().await;
        let peer = harness.peers.latest().unwrap();
        peer.channel_text(r#"{"notify":"snapshot saved"}"#);
        peer.channel_text("garbage");
        harness.pump_peer_events().await;
        assert_eq!(
            harness.ui_events().last(),
            Some(&UiEvent::Notice("snapshot saved".into()))
        );
    }

    #[tokio::test]
    async fn events_from_a_replaced_session_are_ignored() {
        let mut harness = Harness::new(ClientConfig::default());
        let _relay = harness.open().await;
        let stale = harness.peers.latest().unwrap();
        harness.supervisor.on_link_open(&harness.link).await;
        harness.ui_events();

        stale.report(ConnectivityState::Connected);
        harness.pump_peer_events().await;
        assert!(harness.ui_events().is_empty());
        assert_eq!(harness.supervisor.connectivity(), Some(ConnectivityState::New));
        assert_eq!(harness.supervisor.session_id(), Some(2));
    }
}
