//! `webrtc` backed peer sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use relay_proto::{ConnectivityCandidate, DescriptorRole, IceServer, SessionDescriptor};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    LocalMedia, MediaCapture, MediaSource, PeerEvent, PeerEventSink, PeerFactory, PeerNegotiator,
    PeerSessionConfig,
};
use crate::config::CodecPreference;
use crate::negotiation::{ConnectivityState, NegotiationError};
use crate::transfer::{ReliableChannel, TransferError};

const OPUS_PAYLOAD_TYPE: u8 = 111;
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

fn rejected(step: &'static str) -> impl FnOnce(webrtc::Error) -> NegotiationError {
    move |err| NegotiationError::Rejected {
        step,
        reason: err.to_string(),
    }
}

fn peer_error(err: webrtc::Error) -> NegotiationError {
    NegotiationError::Peer(err.to_string())
}

fn build_api(preference: Option<CodecPreference>) -> Result<API, NegotiationError> {
    let mut media = MediaEngine::default();
    match preference {
        None => media.register_default_codecs().map_err(peer_error)?,
        Some(codec) => {
            let (payload_type, fmtp) = match codec {
                CodecPreference::H264 => (102, H264_FMTP),
                CodecPreference::Vp8 => (96, ""),
                CodecPreference::Vp9 => (98, "profile-id=0"),
            };
            media
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: RTCRtpCodecCapability {
                            mime_type: codec.mime_type().to_owned(),
                            clock_rate: 90_000,
                            channels: 0,
                            sdp_fmtp_line: fmtp.to_owned(),
                            rtcp_feedback: vec![],
                        },
                        payload_type,
                        ..Default::default()
                    },
                    RTPCodecType::Video,
                )
                .map_err(peer_error)?;
            media
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: opus_capability(),
                        payload_type: OPUS_PAYLOAD_TYPE,
                        ..Default::default()
                    },
                    RTPCodecType::Audio,
                )
                .map_err(peer_error)?;
        }
    }

    let registry = register_default_interceptors(Registry::new(), &mut media).map_err(peer_error)?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48_000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.to_vec(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn connectivity_from(state: RTCPeerConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectivityState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectivityState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectivityState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn to_rtc(descriptor: &SessionDescriptor) -> Result<RTCSessionDescription, NegotiationError> {
    let sdp = descriptor.sdp.clone();
    let parsed = match descriptor.role {
        DescriptorRole::Offer => RTCSessionDescription::offer(sdp),
        DescriptorRole::Answer => RTCSessionDescription::answer(sdp),
    };
    parsed.map_err(rejected("parse descriptor"))
}

#[derive(Debug, Default)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        config: PeerSessionConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerNegotiator>, NegotiationError> {
        let api = build_api(config.codec_preference)?;
        let rtc_config = RTCConfiguration {
            ice_servers: rtc_ice_servers(&config.ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(peer_error)?);

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(peer_error)?;
        }

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(PeerEvent::LocalCandidate(candidate_from(init)));
                    }
                    Err(err) => {
                        tracing::debug!(target = "peer", error = %err, "dropping unserializable local candidate");
                    }
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(target = "peer", session = events.session(), ?state, "peer connection state");
                if let Some(state) = connectivity_from(state) {
                    events.emit(PeerEvent::Connectivity(state));
                }
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    events.emit(PeerEvent::RemoteTrack {
                        kind: track.kind().to_string(),
                        id: track.id().to_string(),
                    });
                })
            },
        ));

        let channel = pc
            .create_data_channel(
                &config.channel_label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(peer_error)?;
        wire_channel(channel, events.clone()).await;

        Ok(Arc::new(RtcPeer {
            session: config.session,
            pc,
        }))
    }
}

fn candidate_from(init: RTCIceCandidateInit) -> ConnectivityCandidate {
    ConnectivityCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

async fn wire_channel(channel: Arc<RTCDataChannel>, events: PeerEventSink) {
    let label = channel.label().to_owned();
    let open_channel = Arc::clone(&channel);
    let open_events = events.clone();
    channel.on_open(Box::new(move || {
        let channel = Arc::clone(&open_channel);
        let events = open_events.clone();
        Box::pin(async move {
            tracing::debug!(target = "peer", label = channel.label(), "data channel open");
            let label = channel.label().to_owned();
            events.emit(PeerEvent::ChannelOpen(Arc::new(RtcChannel { label, channel })));
        })
    }));

    let close_events = events.clone();
    let close_label = label.clone();
    channel.on_close(Box::new(move || {
        let events = close_events.clone();
        let label = close_label.clone();
        Box::pin(async move {
            events.emit(PeerEvent::ChannelClosed { label });
        })
    }));

    let message_events = events.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            if message.is_string {
                match String::from_utf8(message.data.to_vec()) {
                    Ok(text) => {
                        events.emit(PeerEvent::ChannelText(text));
                    }
                    Err(err) => {
                        tracing::warn!(target = "peer", error = %err, "dropping non utf-8 text frame");
                    }
                }
            } else {
                events.emit(PeerEvent::ChannelBinary(message.data));
            }
        })
    }));

    let low_events = events;
    channel
        .on_buffered_amount_low(Box::new(move || {
            let events = low_events.clone();
            let label = label.clone();
            Box::pin(async move {
                events.emit(PeerEvent::BufferedAmountLow { label });
            })
        }))
        .await;
}

pub struct RtcPeer {
    session: u64,
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerNegotiator for RtcPeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescriptor, NegotiationError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(rejected("create offer"))?;
        Ok(SessionDescriptor::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescriptor, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(rejected("create answer"))?;
        Ok(SessionDescriptor::answer(answer.sdp))
    }

    async fn set_local_descriptor(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_rtc(descriptor)?)
            .await
            .map_err(rejected("set local descriptor"))
    }

    async fn set_remote_descriptor(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc(descriptor)?)
            .await
            .map_err(rejected("set remote descriptor"))
    }

    async fn add_candidate(&self, candidate: &ConnectivityCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await
            .map_err(rejected("add candidate"))
    }

    async fn attach_media(&self, media: &LocalMedia) -> Result<(), NegotiationError> {
        let Some(track) = media.track() else {
            return Err(NegotiationError::Rejected {
                step: "attach media",
                reason: format!("{} has no track", media.label()),
            });
        };
        let sender = self.pc.add_track(track).await.map_err(rejected("attach media"))?;
        let session = self.session;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
            tracing::trace!(target = "peer", session, "rtcp reader finished");
        });
        Ok(())
    }

    async fn release_outbound(&self) -> Result<usize, NegotiationError> {
        let mut released = 0;
        for sender in self.pc.get_senders().await {
            if sender.track().await.is_some() {
                self.pc.remove_track(&sender).await.map_err(peer_error)?;
                released += 1;
            }
        }
        for transceiver in self.pc.get_transceivers().await {
            transceiver.stop().await.map_err(peer_error)?;
        }
        Ok(released)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await.map_err(peer_error)
    }
}

pub struct RtcChannel {
    label: String,
    channel: Arc<RTCDataChannel>,
}

fn channel_error(err: webrtc::Error) -> TransferError {
    TransferError::Channel(err.to_string())
}

#[async_trait]
impl ReliableChannel for RtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.channel.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        self.channel.buffered_amount().await
    }

    async fn set_low_water_mark(&self, threshold: usize) {
        self.channel.set_buffered_amount_low_threshold(threshold).await;
    }

    async fn send_text(&self, text: String) -> Result<(), TransferError> {
        if !self.is_open() {
            return Err(TransferError::ChannelClosed);
        }
        self.channel.send_text(text).await.map_err(channel_error)?;
        Ok(())
    }

    async fn send_bytes(&self, data: Bytes) -> Result<(), TransferError> {
        if !self.is_open() {
            return Err(TransferError::ChannelClosed);
        }
        self.channel.send(&data).await.map_err(channel_error)?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close().await {
            tracing::debug!(target = "peer", error = %err, label = %self.label, "data channel close failed");
        }
    }
}

/// Publishes an Opus sample track for talk-back. Samples are written by
/// whatever feeds [`SampleMedia::track`]; the session only attaches it.
#[derive(Debug, Default)]
pub struct SampleTrackCapture {
    acquired: AtomicU64,
}

impl SampleTrackCapture {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaCapture for SampleTrackCapture {
    async fn acquire(&self) -> Result<LocalMedia, NegotiationError> {
        let index = self.acquired.fetch_add(1, Ordering::Relaxed) + 1;
        let label = format!("microphone-{index}");
        let track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".to_owned(),
            "lookout".to_owned(),
        ));
        tracing::debug!(target = "peer", %label, "acquired local audio track");
        let media: LocalMedia = Arc::new(SampleMedia {
            label,
            track,
            stopped: AtomicBool::new(false),
        });
        Ok(media)
    }
}

pub struct SampleMedia {
    label: String,
    track: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

impl SampleMedia {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl MediaSource for SampleMedia {
    fn label(&self) -> &str {
        &self.label
    }

    fn track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        if self.is_stopped() {
            return None;
        }
        let track: Arc<dyn TrackLocal + Send + Sync> = self.track.clone();
        Some(track)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_states_map_onto_connectivity() {
        assert_eq!(
            connectivity_from(RTCPeerConnectionState::Failed),
            Some(ConnectivityState::Failed)
        );
        assert_eq!(
            connectivity_from(RTCPeerConnectionState::Connected),
            Some(ConnectivityState::Connected)
        );
        assert_eq!(connectivity_from(RTCPeerConnectionState::Unspecified), None);
    }

    #[test]
    fn ice_servers_carry_credentials() {
        let servers = rtc_ice_servers(&[
            IceServer::stun("stun:stun.l.google.com:19302"),
            IceServer {
                urls: relay_proto::IceUrls::Many(vec!["turn:10.0.0.1:3478".into()]),
                username: Some("u".into()),
                credential: Some("p".into()),
            },
        ]);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(servers[0].username, "");
        assert_eq!(servers[1].credential, "p");
    }

    #[tokio::test]
    async fn sample_capture_stops_its_track() {
        let capture = SampleTrackCapture::new();
        let media = capture.acquire().await.unwrap();
        assert_eq!(media.label(), "microphone-1");
        assert!(media.track().is_some());
        media.stop();
        assert!(media.track().is_none());
        let second = capture.acquire().await.unwrap();
        assert_eq!(second.label(), "microphone-2");
    }

    #[test]
    fn preferred_codec_builds_an_api() {
        assert!(build_api(Some(CodecPreference::Vp8)).is_ok());
        assert!(build_api(None).is_ok());
    }
}
