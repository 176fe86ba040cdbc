//! Scriptable peer, channel and capture doubles used by the unit and
//! integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_proto::{ConnectivityCandidate, DescriptorRole, SessionDescriptor};

use super::{
    LocalMedia, MediaCapture, MediaSource, PeerEvent, PeerEventSink, PeerFactory, PeerNegotiator,
    PeerSessionConfig,
};
use crate::negotiation::{ConnectivityState, NegotiationError};
use crate::transfer::{ReliableChannel, TransferError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiatorCall {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(DescriptorRole),
    SetRemote(DescriptorRole),
    AddCandidate(String),
    AttachMedia(String),
    ReleaseOutbound,
    Close,
}

#[derive(Default)]
struct NegotiatorState {
    calls: Vec<NegotiatorCall>,
    applied: Vec<ConnectivityCandidate>,
    attached: Vec<String>,
    reject_remote: bool,
    reject_offers: bool,
    fail_answers: u32,
    closed: bool,
    descriptors: u32,
}

#[derive(Clone, Default)]
pub struct MockNegotiator {
    state: Arc<Mutex<NegotiatorState>>,
}

impl MockNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_remote_descriptors(&self, reject: bool) {
        self.state.lock().reject_remote = reject;
    }

    pub fn reject_offers(&self, reject: bool) {
        self.state.lock().reject_offers = reject;
    }

    /// Makes the next `count` answers fail after the remote offer was applied.
    pub fn fail_answers(&self, count: u32) {
        self.state.lock().fail_answers = count;
    }

    pub fn calls(&self) -> Vec<NegotiatorCall> {
        self.state.lock().calls.clone()
    }

    pub fn applied_candidates(&self) -> Vec<ConnectivityCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn attached_media(&self) -> Vec<String> {
        self.state.lock().attached.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn record(&self, call: NegotiatorCall) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(NegotiationError::Closed);
        }
        state.calls.push(call);
        Ok(())
    }

    fn next_serial(&self) -> u32 {
        let mut state = self.state.lock();
        state.descriptors += 1;
        state.descriptors
    }
}

#[async_trait]
impl PeerNegotiator for MockNegotiator {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescriptor, NegotiationError> {
        self.record(NegotiatorCall::CreateOffer { ice_restart })?;
        if self.state.lock().reject_offers {
            return Err(NegotiationError::Rejected {
                step: "create_offer",
                reason: "mock refused offer".into(),
            });
        }
        let serial = self.next_serial();
        Ok(SessionDescriptor::offer(format!(
            "v=0\r\no=mock {serial} 1 IN IP4 127.0.0.1\r\ns=-\r\na=max-message-size:65536\r\n"
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescriptor, NegotiationError> {
        self.record(NegotiatorCall::CreateAnswer)?;
        {
            let mut state = self.state.lock();
            if state.fail_answers > 0 {
                state.fail_answers -= 1;
                return Err(NegotiationError::Rejected {
                    step: "create_answer",
                    reason: "mock refused answer".into(),
                });
            }
        }
        let serial = self.next_serial();
        Ok(SessionDescriptor::answer(format!(
            "v=0\r\no=mock {serial} 1 IN IP4 127.0.0.1\r\ns=-\r\n"
        )))
    }

    async fn set_local_descriptor(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<(), NegotiationError> {
        self.record(NegotiatorCall::SetLocal(descriptor.role))
    }

    async fn set_remote_descriptor(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<(), NegotiationError> {
        if self.state.lock().reject_remote {
            return Err(NegotiationError::Rejected {
                step: "set_remote_description",
                reason: "mock rejected descriptor".into(),
            });
        }
        self.record(NegotiatorCall::SetRemote(descriptor.role))
    }

    async fn add_candidate(&self, candidate: &ConnectivityCandidate) -> Result<(), NegotiationError> {
        self.record(NegotiatorCall::AddCandidate(candidate.candidate.clone()))?;
        self.state.lock().applied.push(candidate.clone());
        Ok(())
    }

    async fn attach_media(&self, media: &LocalMedia) -> Result<(), NegotiationError> {
        self.record(NegotiatorCall::AttachMedia(media.label().to_owned()))?;
        self.state.lock().attached.push(media.label().to_owned());
        Ok(())
    }

    async fn release_outbound(&self) -> Result<usize, NegotiationError> {
        self.record(NegotiatorCall::ReleaseOutbound)?;
        let mut state = self.state.lock();
        let released = state.attached.len();
        state.attached.clear();
        Ok(released)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        state.calls.push(NegotiatorCall::Close);
        state.closed = true;
        Ok(())
    }
}

/// One peer created through [`MockPeerFactory`], with the sink the core
/// listens on so tests can play the peer layer's part.
#[derive(Clone)]
pub struct MockPeer {
    pub config: PeerSessionConfig,
    pub negotiator: MockNegotiator,
    pub events: PeerEventSink,
}

impl MockPeer {
    pub fn session(&self) -> u64 {
        self.config.session
    }

    pub fn report(&self, state: ConnectivityState) {
        self.events.emit(PeerEvent::Connectivity(state));
    }

    pub fn local_candidate(&self, candidate: ConnectivityCandidate) {
        self.events.emit(PeerEvent::LocalCandidate(candidate));
    }

    pub fn open_channel(&self, channel: &Arc<MockChannel>) {
        channel.attach_events(self.events.clone());
        self.events
            .emit(PeerEvent::ChannelOpen(Arc::clone(channel) as Arc<dyn ReliableChannel>));
    }

    pub fn channel_text(&self, text: impl Into<String>) {
        self.events.emit(PeerEvent::ChannelText(text.into()));
    }
}

#[derive(Default)]
struct FactoryState {
    peers: Vec<MockPeer>,
    fail_next: bool,
}

#[derive(Clone, Default)]
pub struct MockPeerFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self) {
        self.state.lock().fail_next = true;
    }

    pub fn created(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn peers(&self) -> Vec<MockPeer> {
        self.state.lock().peers.clone()
    }

    pub fn latest(&self) -> Option<MockPeer> {
        self.state.lock().peers.last().cloned()
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(
        &self,
        config: PeerSessionConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerNegotiator>, NegotiationError> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(NegotiationError::Peer("mock factory failure".into()));
        }
        let negotiator = MockNegotiator::new();
        state.peers.push(MockPeer {
            config,
            negotiator: negotiator.clone(),
            events,
        });
        Ok(Arc::new(negotiator))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Text(String),
    Binary(Bytes),
}

struct ChannelState {
    frames: Vec<ChannelFrame>,
    buffered: usize,
    low_water_mark: Option<usize>,
    open: bool,
    events: Option<PeerEventSink>,
}

/// Channel whose buffered amount only drops when the test calls
/// [`MockChannel::drain`].
pub struct MockChannel {
    label: String,
    state: Mutex<ChannelState>,
}

impl MockChannel {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            state: Mutex::new(ChannelState {
                frames: Vec::new(),
                buffered: 0,
                low_water_mark: None,
                open: true,
                events: None,
            }),
        })
    }

    pub fn attach_events(&self, events: PeerEventSink) {
        self.state.lock().events = Some(events);
    }

    pub fn frames(&self) -> Vec<ChannelFrame> {
        self.state.lock().frames.clone()
    }

    pub fn binary_frames(&self) -> Vec<Bytes> {
        self.state
            .lock()
            .frames
            .iter()
            .filter_map(|frame| match frame {
                ChannelFrame::Binary(data) => Some(data.clone()),
                ChannelFrame::Text(_) => None,
            })
            .collect()
    }

    pub fn text_frames(&self) -> Vec<String> {
        self.state
            .lock()
            .frames
            .iter()
            .filter_map(|frame| match frame {
                ChannelFrame::Text(text) => Some(text.clone()),
                ChannelFrame::Binary(_) => None,
            })
            .collect()
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().buffered
    }

    pub fn low_water_mark(&self) -> Option<usize> {
        self.state.lock().low_water_mark
    }

    /// Simulates the transport flushing `bytes`; reports a low-water crossing
    /// the way a real channel does.
    pub fn drain(&self, bytes: usize) {
        let crossed = {
            let mut state = self.state.lock();
            let before = state.buffered;
            state.buffered = before.saturating_sub(bytes);
            match (state.low_water_mark, &state.events) {
                (Some(low), Some(events)) if before > low && state.buffered <= low => {
                    Some(events.clone())
                }
                _ => None,
            }
        };
        if let Some(events) = crossed {
            events.emit(PeerEvent::BufferedAmountLow {
                label: self.label.clone(),
            });
        }
    }

    pub fn close_now(&self) {
        let events = {
            let mut state = self.state.lock();
            state.open = false;
            state.events.clone()
        };
        if let Some(events) = events {
            events.emit(PeerEvent::ChannelClosed {
                label: self.label.clone(),
            });
        }
    }

    fn push(&self, frame: ChannelFrame, len: usize) -> Result<(), TransferError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransferError::ChannelClosed);
        }
        state.buffered += len;
        state.frames.push(frame);
        Ok(())
    }
}

#[async_trait]
impl ReliableChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn buffered_amount(&self) -> usize {
        self.state.lock().buffered
    }

    async fn set_low_water_mark(&self, threshold: usize) {
        self.state.lock().low_water_mark = Some(threshold);
    }

    async fn send_text(&self, text: String) -> Result<(), TransferError> {
        let len = text.len();
        self.push(ChannelFrame::Text(text), len)
    }

    async fn send_bytes(&self, data: Bytes) -> Result<(), TransferError> {
        let len = data.len();
        self.push(ChannelFrame::Binary(data), len)
    }

    async fn close(&self) {
        self.state.lock().open = false;
    }
}

pub struct MockMedia {
    label: String,
    stopped: AtomicBool,
}

impl MockMedia {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaSource for MockMedia {
    fn label(&self) -> &str {
        &self.label
    }

    fn track(&self) -> Option<Arc<dyn webrtc::track::track_local::TrackLocal + Send + Sync>> {
        None
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct MockCapture {
    sources: Arc<Mutex<Vec<Arc<MockMedia>>>>,
}

impl MockCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sources(&self) -> Vec<Arc<MockMedia>> {
        self.sources.lock().clone()
    }
}

#[async_trait]
impl MediaCapture for MockCapture {
    async fn acquire(&self) -> Result<LocalMedia, NegotiationError> {
        let mut sources = self.sources.lock();
        let media = Arc::new(MockMedia {
            label: format!("microphone-{}", sources.len() + 1),
            stopped: AtomicBool::new(false),
        });
        sources.push(Arc::clone(&media));
        Ok(media)
    }
}
