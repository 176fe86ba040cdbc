//! Offer/answer and candidate bookkeeping for one peer session.

use std::collections::VecDeque;
use std::time::Instant;

use relay_proto::{ConnectivityCandidate, DescriptorRole, SessionDescriptor, SignalEnvelope};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::NegotiationRole;
use crate::peer::PeerNegotiator;
use crate::telemetry::{self, Measure, PerfGuard};
use crate::transport::{TransportError, TransportLink};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer rejected {step}: {reason}")]
    Rejected { step: &'static str, reason: String },
    #[error("{operation} not allowed while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ConnectivityState,
    },
    #[error("peer connection error: {0}")]
    Peer(String),
    #[error("session closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub fn can_transition_to(self, next: ConnectivityState) -> bool {
        use ConnectivityState::*;
        match (self, next) {
            (Closed, _) => false,
            (from, to) if from == to => false,
            (_, Closed) => true,
            (New, Connecting | Connected | Failed) => true,
            (Connecting, Connected | Failed | Disconnected) => true,
            (Connected, Disconnected | Failed | Connecting) => true,
            (Disconnected, Connecting | Connected | Failed) => true,
            (Failed, Connecting | Connected | Disconnected) => true,
            _ => false,
        }
    }

    /// States in which locally sourced media must be stopped.
    pub fn is_degraded(self) -> bool {
        matches!(self, ConnectivityState::Disconnected | ConnectivityState::Failed)
    }
}

/// Where the negotiation machine sends locally produced descriptors.
pub trait SignalSink: Send + Sync {
    fn transmit(&self, envelope: &SignalEnvelope) -> Result<(), TransportError>;
}

impl SignalSink for TransportLink {
    fn transmit(&self, envelope: &SignalEnvelope) -> Result<(), TransportError> {
        self.send(envelope)
    }
}

impl SignalSink for mpsc::UnboundedSender<SignalEnvelope> {
    fn transmit(&self, envelope: &SignalEnvelope) -> Result<(), TransportError> {
        self.send(envelope.clone())
            .map_err(|_| TransportError::ChannelClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorOutcome {
    /// Same descriptor as the one already applied.
    Duplicate,
    Answered,
    AnswerApplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Buffered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectivityState,
    pub to: ConnectivityState,
}

pub struct NegotiationStateMachine {
    session: u64,
    role: NegotiationRole,
    state: ConnectivityState,
    local: Option<SessionDescriptor>,
    remote: Option<SessionDescriptor>,
    awaiting_answer: bool,
    restart_in_flight: bool,
    pending_candidates: VecDeque<ConnectivityCandidate>,
    created: Instant,
    connected_once: bool,
}

impl NegotiationStateMachine {
    pub fn new(session: u64, role: NegotiationRole) -> Self {
        Self {
            session,
            role,
            state: ConnectivityState::New,
            local: None,
            remote: None,
            awaiting_answer: false,
            restart_in_flight: false,
            pending_candidates: VecDeque::new(),
            created: Instant::now(),
            connected_once: false,
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn local_descriptor(&self) -> Option<&SessionDescriptor> {
        self.local.as_ref()
    }

    pub fn remote_descriptor(&self) -> Option<&SessionDescriptor> {
        self.remote.as_ref()
    }

    pub fn awaiting_answer(&self) -> bool {
        self.awaiting_answer
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn has_descriptor_pair(&self) -> bool {
        self.local.is_some() && self.remote.is_some()
    }

    /// True when this side is configured to offer and nothing was exchanged yet.
    pub fn should_initiate(&self) -> bool {
        self.role == NegotiationRole::Offer
            && self.state == ConnectivityState::New
            && self.local.is_none()
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.state == ConnectivityState::Closed {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    pub async fn on_remote_descriptor(
        &mut self,
        peer: &dyn PeerNegotiator,
        sink: &dyn SignalSink,
        descriptor: SessionDescriptor,
    ) -> Result<DescriptorOutcome, NegotiationError> {
        self.ensure_open()?;
        if self.remote.as_ref() == Some(&descriptor) {
            tracing::debug!(
                target = "negotiation",
                session = self.session,
                "ignoring repeated remote descriptor"
            );
            return Ok(DescriptorOutcome::Duplicate);
        }

        match descriptor.role {
            DescriptorRole::Offer => {
                if self.awaiting_answer {
                    return Err(NegotiationError::InvalidState {
                        operation: "accept remote offer with a local offer outstanding",
                        state: self.state,
                    });
                }
                let _perf = PerfGuard::new(Measure::AnswerRemoteOffer);
                peer.set_remote_descriptor(&descriptor).await?;
                let answer = peer.create_answer().await?;
                peer.set_local_descriptor(&answer).await?;
                self.remote = Some(descriptor);
                self.local = Some(answer.clone());
                self.transmit(sink, SignalEnvelope::descriptor(answer));
                if self.state == ConnectivityState::New {
                    self.state = ConnectivityState::Connecting;
                }
                tracing::debug!(
                    target = "negotiation",
                    session = self.session,
                    state = ?self.state,
                    "answered remote offer"
                );
                self.flush_candidates(peer).await;
                Ok(DescriptorOutcome::Answered)
            }
            DescriptorRole::Answer => {
                if !self.awaiting_answer {
                    return Err(NegotiationError::InvalidState {
                        operation: "apply answer without a local offer",
                        state: self.state,
                    });
                }
                peer.set_remote_descriptor(&descriptor).await?;
                self.remote = Some(descriptor);
                self.awaiting_answer = false;
                tracing::debug!(
                    target = "negotiation",
                    session = self.session,
                    "applied remote answer"
                );
                self.flush_candidates(peer).await;
                Ok(DescriptorOutcome::AnswerApplied)
            }
        }
    }

    pub async fn on_remote_candidate(
        &mut self,
        peer: &dyn PeerNegotiator,
        candidate: ConnectivityCandidate,
    ) -> Result<CandidateOutcome, NegotiationError> {
        self.ensure_open()?;
        if !self.has_descriptor_pair() {
            self.pending_candidates.push_back(candidate);
            tracing::trace!(
                target = "negotiation",
                session = self.session,
                pending = self.pending_candidates.len(),
                "buffered remote candidate"
            );
            return Ok(CandidateOutcome::Buffered);
        }
        peer.add_candidate(&candidate).await?;
        Ok(CandidateOutcome::Applied)
    }

    /// Produces and sends a local offer. Also used to renegotiate after local
    /// media was attached.
    pub async fn initiate(
        &mut self,
        peer: &dyn PeerNegotiator,
        sink: &dyn SignalSink,
    ) -> Result<(), NegotiationError> {
        self.offer(peer, sink, false).await
    }

    async fn offer(
        &mut self,
        peer: &dyn PeerNegotiator,
        sink: &dyn SignalSink,
        ice_restart: bool,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if self.awaiting_answer {
            return Err(NegotiationError::InvalidState {
                operation: "create offer while another is unanswered",
                state: self.state,
            });
        }
        let _perf = PerfGuard::new(Measure::LocalOffer);
        let offer = peer.create_offer(ice_restart).await?;
        peer.set_local_descriptor(&offer).await?;
        self.local = Some(offer.clone());
        self.awaiting_answer = true;
        self.transmit(sink, SignalEnvelope::descriptor(offer));
        if matches!(
            self.state,
            ConnectivityState::New | ConnectivityState::Failed | ConnectivityState::Disconnected
        ) {
            self.state = ConnectivityState::Connecting;
        }
        tracing::debug!(
            target = "negotiation",
            session = self.session,
            ice_restart,
            "sent local offer"
        );
        Ok(())
    }

    /// Folds a connectivity report from the peer layer into the session state.
    /// A failure while connected triggers an ICE restart; if that cannot be
    /// started, or fails again, the session becomes `Disconnected`.
    pub async fn on_connectivity(
        &mut self,
        peer: &dyn PeerNegotiator,
        sink: &dyn SignalSink,
        reported: ConnectivityState,
    ) -> Option<Transition> {
        let from = self.state;
        if from == ConnectivityState::Closed {
            return None;
        }

        if reported == ConnectivityState::Failed {
            if self.restart_in_flight {
                self.restart_in_flight = false;
                self.state = ConnectivityState::Disconnected;
                tracing::warn!(
                    target = "negotiation",
                    session = self.session,
                    "connectivity restart failed"
                );
            } else if from == ConnectivityState::Connected {
                self.awaiting_answer = false;
                match self.offer(peer, sink, true).await {
                    Ok(()) => {
                        self.restart_in_flight = true;
                        self.state = ConnectivityState::Connecting;
                        tracing::info!(
                            target = "negotiation",
                            session = self.session,
                            "connectivity failed, restarting ice"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "negotiation",
                            session = self.session,
                            error = %err,
                            "could not start connectivity restart"
                        );
                        self.state = ConnectivityState::Disconnected;
                    }
                }
            } else {
                self.state = ConnectivityState::Failed;
            }
        } else if from.can_transition_to(reported) {
            self.state = reported;
            if reported == ConnectivityState::Connected {
                self.restart_in_flight = false;
                if !std::mem::replace(&mut self.connected_once, true) {
                    telemetry::elapsed(Measure::TimeToConnected, self.created.elapsed());
                }
            }
        }

        (self.state != from).then_some(Transition {
            from,
            to: self.state,
        })
    }

    /// Closes the session. Buffered candidates are discarded.
    pub async fn stop(&mut self, peer: &dyn PeerNegotiator) -> Option<Transition> {
        let from = self.state;
        if from == ConnectivityState::Closed {
            return None;
        }
        self.state = ConnectivityState::Closed;
        self.pending_candidates.clear();
        self.awaiting_answer = false;
        self.restart_in_flight = false;
        if let Err(err) = peer.close().await {
            tracing::debug!(
                target = "negotiation",
                session = self.session,
                error = %err,
                "peer close reported an error"
            );
        }
        Some(Transition {
            from,
            to: ConnectivityState::Closed,
        })
    }

    async fn flush_candidates(&mut self, peer: &dyn PeerNegotiator) -> usize {
        if !self.has_descriptor_pair() {
            return 0;
        }
        let mut applied = 0;
        while let Some(candidate) = self.pending_candidates.pop_front() {
            match peer.add_candidate(&candidate).await {
                Ok(()) => applied += 1,
                Err(err) => tracing::warn!(
                    target = "negotiation",
                    session = self.session,
                    error = %err,
                    "buffered candidate rejected"
                ),
            }
        }
        if applied > 0 {
            tracing::debug!(
                target = "negotiation",
                session = self.session,
                applied,
                "flushed buffered candidates"
            );
        }
        applied
    }

    fn transmit(&self, sink: &dyn SignalSink, envelope: SignalEnvelope) {
        if let Err(err) = sink.transmit(&envelope) {
            tracing::warn!(
                target = "negotiation",
                session = self.session,
                kind = envelope.kind().as_wire(),
                error = %err,
                "failed to transmit local descriptor"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::{MockNegotiator, NegotiatorCall};

    fn machine() -> NegotiationStateMachine {
        NegotiationStateMachine::new(1, NegotiationRole::Answer)
    }

    fn sink() -> (
        mpsc::UnboundedSender<SignalEnvelope>,
        mpsc::UnboundedReceiver<SignalEnvelope>,
    ) {
        mpsc::unbounded_channel()
    }

    fn candidate(n: u16) -> ConnectivityCandidate {
        let mut candidate = ConnectivityCandidate::new(format!(
            "candidate:{n} 1 UDP 2122252543 192.168.1.{n} 5000{n} typ host"
        ));
        candidate.sdp_mline_index = Some(0);
        candidate
    }

    #[tokio::test]
    async fn remote_offer_produces_answer() {
        let peer = MockNegotiator::new();
        let (tx, mut rx) = sink();
        let mut nsm = machine();

        let outcome = nsm
            .on_remote_descriptor(&peer, &tx, SessionDescriptor::offer("v=0 remote"))
            .await
            .unwrap();
        assert_eq!(outcome, DescriptorOutcome::Answered);
        assert_eq!(nsm.state(), ConnectivityState::Connecting);

        let Some(SignalEnvelope::SessionDescription { data }) = rx.try_recv().ok() else {
            panic!("expected an answer");
        };
        assert_eq!(data.role, DescriptorRole::Answer);
        assert_eq!(nsm.local_descriptor(), Some(&data));
    }

    #[tokio::test]
    async fn candidates_buffer_until_pair_then_apply_in_order() {
        let peer = MockNegotiator::new();
        let (tx, _rx) = sink();
        let mut nsm = machine();

        for n in 1..=3 {
            let outcome = nsm.on_remote_candidate(&peer, candidate(n)).await.unwrap();
            assert_eq!(outcome, CandidateOutcome::Buffered);
        }
        assert_eq!(nsm.pending_candidates(), 3);
        assert!(peer.applied_candidates().is_empty());

        nsm.on_remote_descriptor(&peer, &tx, SessionDescriptor::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(nsm.pending_candidates(), 0);
        assert_eq!(
            peer.applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );

        let outcome = nsm.on_remote_candidate(&peer, candidate(4)).await.unwrap();
        assert_eq!(outcome, CandidateOutcome::Applied);
        assert_eq!(peer.applied_candidates().len(), 4);
    }

    #[tokio::test]
    async fn repeated_offer_is_ignored() {
        let peer = MockNegotiator::new();
        let (tx, mut rx) = sink();
        let mut nsm = machine();
        let offer = SessionDescriptor::offer("v=0 same");

        nsm.on_remote_descriptor(&peer, &tx, offer.clone())
            .await
            .unwrap();
        let answer = nsm.local_descriptor().cloned();
        let outcome = nsm.on_remote_descriptor(&peer, &tx, offer).await.unwrap();

        assert_eq!(outcome, DescriptorOutcome::Duplicate);
        assert_eq!(nsm.local_descriptor().cloned(), answer);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(
            peer.calls()
                .iter()
                .filter(|call| matches!(call, NegotiatorCall::CreateAnswer))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn rejected_offer_leaves_state_untouched() {
        let peer = MockNegotiator::new();
        peer.reject_remote_descriptors(true);
        let (tx, mut rx) = sink();
        let mut nsm = machine();

        let err = nsm
            .on_remote_descriptor(&peer, &tx, SessionDescriptor::offer("garbage"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Rejected { .. }));
        assert_eq!(nsm.state(), ConnectivityState::New);
        assert!(nsm.remote_descriptor().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn resent_offer_is_answered_after_a_failed_answer() {
        let peer = MockNegotiator::new();
        peer.fail_answers(1);
        let (tx, mut rx) = sink();
        let mut nsm = machine();
        let offer = SessionDescriptor::offer("v=0 resent");

        nsm.on_remote_candidate(&peer, candidate(1)).await.unwrap();
        let err = nsm
            .on_remote_descriptor(&peer, &tx, offer.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Rejected { .. }));
        assert_eq!(nsm.state(), ConnectivityState::New);
        assert!(nsm.remote_descriptor().is_none());
        assert!(nsm.local_descriptor().is_none());
        assert!(rx.try_recv().is_err());

        let outcome = nsm.on_remote_descriptor(&peer, &tx, offer).await.unwrap();
        assert_eq!(outcome, DescriptorOutcome::Answered);
        assert_eq!(nsm.state(), ConnectivityState::Connecting);
        assert!(matches!(
            rx.try_recv(),
            Ok(SignalEnvelope::SessionDescription { .. })
        ));
        assert_eq!(peer.applied_candidates(), vec![candidate(1)]);
    }

    #[tokio::test]
    async fn answer_only_applies_after_local_offer() {
        let peer = MockNegotiator::new();
        let (tx, mut rx) = sink();
        let mut nsm = NegotiationStateMachine::new(2, NegotiationRole::Offer);

        let err = nsm
            .on_remote_descriptor(&peer, &tx, SessionDescriptor::answer("v=0 early"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidState { .. }));

        assert!(nsm.should_initiate());
        nsm.initiate(&peer, &tx).await.unwrap();
        assert_eq!(nsm.state(), ConnectivityState::Connecting);
        assert!(nsm.awaiting_answer());
        let Ok(SignalEnvelope::SessionDescription { data }) = rx.try_recv() else {
            panic!("expected offer");
        };
        assert_eq!(data.role, DescriptorRole::Offer);

        assert!(matches!(
            nsm.initiate(&peer, &tx).await,
            Err(NegotiationError::InvalidState { .. })
        ));

        let outcome = nsm
            .on_remote_descriptor(&peer, &tx, SessionDescriptor::answer("v=0 answer"))
            .await
            .unwrap();
        assert_eq!(outcome, DescriptorOutcome::AnswerApplied);
        assert!(!nsm.awaiting_answer());
    }

    #[tokio::test]
    async fn failure_while_connected_restarts_ice() {
        let peer = MockNegotiator::new();
        let (tx, mut rx) = sink();
        let mut nsm = machine();
        nsm.on_remote_descriptor(&peer, &tx, SessionDescriptor::offer("v=0"))
            .await
            .unwrap();
        let _answer = rx.try_recv().unwrap();

        let up = nsm
            .on_connectivity(&peer, &tx, ConnectivityState::Connected)
            .await;
        assert_eq!(up.map(|t| t.to), Some(ConnectivityState::Connected));

        let restart = nsm
            .on_connectivity(&peer, &tx, ConnectivityState::Failed)
            .await
            .unwrap();
        assert_eq!(restart.to, ConnectivityState::Connecting);
        assert!(peer.calls().contains(&NegotiatorCall::CreateOffer { ice_restart: true }));
        assert!(matches!(
            rx.try_recv(),
            Ok(SignalEnvelope::SessionDescription { data }) if data.role == DescriptorRole::Offer
        ));

        let gave_up = nsm
            .on_connectivity(&peer, &tx, ConnectivityState::Failed)
            .await
            .unwrap();
        assert_eq!(gave_up.to, ConnectivityState::Disconnected);
    }

    #[tokio::test]
    async fn restart_that_cannot_start_disconnects() {
        let peer = MockNegotiator::new();
        let (tx, _rx) = sink();
        let mut nsm = machine();
        nsm.on_remote_descriptor(&peer, &tx, SessionDescriptor::offer("v=0"))
            .await
            .unwrap();
        nsm.on_connectivity(&peer, &tx, ConnectivityState::Connected)
            .await;

        peer.reject_offers(true);
        let transition = nsm
            .on_connectivity(&peer, &tx, ConnectivityState::Failed)
            .await
            .unwrap();
        assert_eq!(transition.to, ConnectivityState::Disconnected);
    }

    #[tokio::test]
    async fn stop_closes_for_good() {
        let peer = MockNegotiator::new();
        let (tx, _rx) = sink();
        let mut nsm = machine();
        nsm.on_remote_candidate(&peer, candidate(1)).await.unwrap();

        let transition = nsm.stop(&peer).await.unwrap();
        assert_eq!(transition.to, ConnectivityState::Closed);
        assert_eq!(nsm.pending_candidates(), 0);
        assert!(peer.is_closed());
        assert!(nsm.stop(&peer).await.is_none());
        assert!(matches!(
            nsm.on_remote_descriptor(&peer, &tx, SessionDescriptor::offer("v=0"))
                .await,
            Err(NegotiationError::Closed)
        ));
        assert!(nsm
            .on_connectivity(&peer, &tx, ConnectivityState::Connected)
            .await
            .is_none());
    }

    #[test]
    fn transition_table() {
        use ConnectivityState::*;
        assert!(New.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(!Closed.can_transition_to(New));
        assert!(!Connected.can_transition_to(New));
        assert!(!Connected.can_transition_to(Connected));
        assert!(Disconnected.is_degraded() && Failed.is_degraded());
    }
}
