//! Seam between the session core and the peer connection implementation.
//!
//! The core only ever talks to a [`PeerNegotiator`]; peer callbacks are posted
//! as [`PeerEvent`]s tagged with the session they belong to so the single
//! event loop can drop anything from a discarded session.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use relay_proto::{ConnectivityCandidate, IceServer, SessionDescriptor};
use tokio::sync::mpsc;

use crate::config::CodecPreference;
use crate::negotiation::{ConnectivityState, NegotiationError};
use crate::transfer::ReliableChannel;

pub mod mock;
pub mod rtc;

pub use rtc::{RtcPeerFactory, SampleTrackCapture};

/// Locally captured media, owned by the capture subsystem.
pub trait MediaSource: Send + Sync {
    fn label(&self) -> &str;

    /// Track to publish, when the source is backed by one.
    fn track(&self) -> Option<Arc<dyn webrtc::track::track_local::TrackLocal + Send + Sync>>;

    fn stop(&self);
}

pub type LocalMedia = Arc<dyn MediaSource>;

#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, NegotiationError>;
}

#[async_trait]
pub trait PeerNegotiator: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescriptor, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescriptor, NegotiationError>;

    async fn set_local_descriptor(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_descriptor(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<(), NegotiationError>;

    async fn add_candidate(&self, candidate: &ConnectivityCandidate) -> Result<(), NegotiationError>;

    async fn attach_media(&self, media: &LocalMedia) -> Result<(), NegotiationError>;

    /// Removes every outbound sender and stops every transceiver. Returns the
    /// number of senders released.
    async fn release_outbound(&self) -> Result<usize, NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

#[derive(Debug, Clone)]
pub struct PeerSessionConfig {
    pub session: u64,
    pub ice_servers: Vec<IceServer>,
    pub channel_label: String,
    pub codec_preference: Option<CodecPreference>,
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        config: PeerSessionConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerNegotiator>, NegotiationError>;
}

pub enum PeerEvent {
    LocalCandidate(ConnectivityCandidate),
    Connectivity(ConnectivityState),
    ChannelOpen(Arc<dyn ReliableChannel>),
    ChannelText(String),
    ChannelBinary(Bytes),
    ChannelClosed { label: String },
    BufferedAmountLow { label: String },
    RemoteTrack { kind: String, id: String },
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            PeerEvent::Connectivity(state) => f.debug_tuple("Connectivity").field(state).finish(),
            PeerEvent::ChannelOpen(channel) => {
                f.debug_tuple("ChannelOpen").field(&channel.label()).finish()
            }
            PeerEvent::ChannelText(text) => f.debug_tuple("ChannelText").field(&text.len()).finish(),
            PeerEvent::ChannelBinary(data) => {
                f.debug_tuple("ChannelBinary").field(&data.len()).finish()
            }
            PeerEvent::ChannelClosed { label } => {
                f.debug_struct("ChannelClosed").field("label", label).finish()
            }
            PeerEvent::BufferedAmountLow { label } => {
                f.debug_struct("BufferedAmountLow").field("label", label).finish()
            }
            PeerEvent::RemoteTrack { kind, id } => f
                .debug_struct("RemoteTrack")
                .field("kind", kind)
                .field("id", id)
                .finish(),
        }
    }
}

#[derive(Debug)]
pub struct SessionPeerEvent {
    pub session: u64,
    pub event: PeerEvent,
}

/// Handed to a peer implementation so its callbacks can reach the event loop.
#[derive(Clone)]
pub struct PeerEventSink {
    session: u64,
    tx: mpsc::UnboundedSender<SessionPeerEvent>,
}

impl PeerEventSink {
    pub fn new(session: u64, tx: mpsc::UnboundedSender<SessionPeerEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Returns `false` once the event loop has gone away.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(SessionPeerEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }
}
