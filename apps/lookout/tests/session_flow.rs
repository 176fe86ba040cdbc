use std::sync::Arc;
use std::time::Duration;

use lookout_client_core::config::{ClientConfig, NegotiationRole};
use lookout_client_core::negotiation::ConnectivityState;
use lookout_client_core::peer::mock::{MockCapture, MockChannel, MockPeer, MockPeerFactory};
use lookout_client_core::session::{self, SessionHandle, StatusSnapshot, UiEvent};
use lookout_client_core::transfer::TransferState;
use lookout_client_core::transport::LinkState;
use lookout_client_core::transport::mock::{MockConnector, MockRelay};
use relay_proto::{
    ConnectivityCandidate, DescriptorRole, RemoteCommand, SessionDescriptor, SignalEnvelope,
};
use serde_json::{Value, json};
use test_timeout::tokio_timeout_test;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Client {
    handle: SessionHandle,
    events: UnboundedReceiver<UiEvent>,
    task: JoinHandle<()>,
    connector: MockConnector,
    peers: MockPeerFactory,
}

impl Client {
    fn start(config: ClientConfig) -> Self {
        let connector = MockConnector::new();
        let peers = MockPeerFactory::new();
        let (handle, events, task) = session::start(
            config,
            Arc::new(connector.clone()),
            Arc::new(peers.clone()),
            Arc::new(MockCapture::new()),
        )
        .expect("valid config");
        Self {
            handle,
            events,
            task,
            connector,
            peers,
        }
    }

    async fn wait_for<F>(&mut self, mut matches: F) -> UiEvent
    where
        F: FnMut(&UiEvent) -> bool,
    {
        loop {
            let event = self.events.recv().await.expect("session loop ended");
            if matches(&event) {
                return event;
            }
        }
    }

    /// Waits until the relay is open and session `id` exists.
    async fn session_ready(&mut self, id: u64) -> MockPeer {
        self.wait_for(|event| {
            matches!(event, UiEvent::Connectivity { session, state: ConnectivityState::New } if *session == id)
        })
        .await;
        self.peers.latest().expect("peer created")
    }

    async fn status(&mut self) -> StatusSnapshot {
        self.handle.request_status().unwrap();
        match self
            .wait_for(|event| matches!(event, UiEvent::Status(_)))
            .await
        {
            UiEvent::Status(snapshot) => snapshot,
            _ => unreachable!(),
        }
    }
}

fn offer(sdp: &str) -> SignalEnvelope {
    SignalEnvelope::descriptor(SessionDescriptor::offer(sdp))
}

async fn expect_answer(relay: &mut MockRelay) -> SessionDescriptor {
    match relay.next_envelope().await {
        Some(SignalEnvelope::SessionDescription { data }) => {
            assert_eq!(data.role, DescriptorRole::Answer);
            data
        }
        other => panic!("expected an answer, got {other:?}"),
    }
}

#[tokio_timeout_test(10)]
async fn remote_offer_is_answered_and_session_connects() {
    let mut client = Client::start(ClientConfig::default());
    let mut relay = client.connector.next_relay().await.unwrap();
    let peer = client.session_ready(1).await;

    relay.push_envelope(&offer("v=0\r\ns=device\r\n"));
    expect_answer(&mut relay).await;
    client
        .wait_for(|event| {
            *event
                == UiEvent::Connectivity {
                    session: 1,
                    state: ConnectivityState::Connecting,
                }
        })
        .await;

    peer.report(ConnectivityState::Connected);
    client
        .wait_for(|event| {
            *event
                == UiEvent::Connectivity {
                    session: 1,
                    state: ConnectivityState::Connected,
                }
        })
        .await;

    relay.push_envelope(&offer("v=0\r\ns=device\r\n"));
    let snapshot = client.status().await;
    assert_eq!(snapshot.connectivity, Some(ConnectivityState::Connected));
    assert_eq!(client.peers.created(), 1);
    assert!(relay.try_next_envelope().is_none());
}

#[tokio_timeout_test(10)]
async fn early_candidates_are_applied_once_in_arrival_order() {
    let mut client = Client::start(ClientConfig::default());
    let mut relay = client.connector.next_relay().await.unwrap();
    let peer = client.session_ready(1).await;

    for n in 1..=3 {
        relay.push_envelope(&SignalEnvelope::candidate(ConnectivityCandidate::new(format!(
            "candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"
        ))));
    }
    relay.push_envelope(&offer("v=0\r\n"));
    expect_answer(&mut relay).await;
    client.status().await;

    let applied: Vec<String> = peer
        .negotiator
        .applied_candidates()
        .into_iter()
        .map(|candidate| candidate.candidate)
        .collect();
    assert_eq!(applied.len(), 3);
    assert!(applied[0].starts_with("candidate:1"));
    assert!(applied[2].starts_with("candidate:3"));

    relay.push_envelope(&SignalEnvelope::candidate(ConnectivityCandidate::new(
        "candidate:4 1 udp 1 10.0.0.4 5000 typ host",
    )));
    client.status().await;
    assert_eq!(peer.negotiator.applied_candidates().len(), 4);
}

#[tokio_timeout_test(10)]
async fn offering_side_sends_first_and_applies_answer() {
    let config = ClientConfig {
        role: NegotiationRole::Offer,
        ..ClientConfig::default()
    };
    let mut client = Client::start(config);
    let mut relay = client.connector.next_relay().await.unwrap();

    let Some(SignalEnvelope::SessionDescription { data }) = relay.next_envelope().await else {
        panic!("expected an offer");
    };
    assert_eq!(data.role, DescriptorRole::Offer);

    relay.push_envelope(&SignalEnvelope::descriptor(SessionDescriptor::answer("v=0\r\n")));
    let snapshot = client.status().await;
    assert_eq!(snapshot.connectivity, Some(ConnectivityState::Connecting));
    let peer = client.peers.latest().unwrap();
    assert_eq!(peer.session(), 1);
}

#[tokio_timeout_test(10)]
async fn clip_is_announced_then_sent_in_four_chunks() {
    let mut client = Client::start(ClientConfig::default());
    let mut relay = client.connector.next_relay().await.unwrap();
    let peer = client.session_ready(1).await;

    client
        .handle
        .send_clip("voice.ogg", "audio/ogg", vec![3u8; 50_000])
        .unwrap();
    relay.push_envelope(&offer("v=0\r\na=max-message-size:262144\r\n"));
    expect_answer(&mut relay).await;

    let channel = MockChannel::new("web page channel");
    peer.open_channel(&channel);
    peer.report(ConnectivityState::Connected);

    let done = client
        .wait_for(|event| {
            matches!(event, UiEvent::Transfer(progress) if progress.state == TransferState::Completed)
        })
        .await;
    let UiEvent::Transfer(progress) = done else {
        unreachable!();
    };
    assert_eq!(progress.bytes_queued, 50_000);

    let announcement: Value = serde_json::from_str(&channel.text_frames()[0]).unwrap();
    assert_eq!(
        announcement,
        json!({"type": "sendfile", "file": {"type": "audio/ogg", "size": 50000, "name": "voice.ogg"}})
    );
    let chunks = channel.binary_frames();
    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks.iter().map(|chunk| chunk.len()).sum::<usize>(), 50_000);
    assert!(chunks[3].len() < 16_384);
}

#[tokio_timeout_test(10)]
async fn channel_close_fails_the_transfer_in_flight() {
    let mut config = ClientConfig::default();
    config.transfer.max_buffered = 32_768;
    let mut client = Client::start(config);
    let mut relay = client.connector.next_relay().await.unwrap();
    let peer = client.session_ready(1).await;

    relay.push_envelope(&offer("v=0\r\n"));
    expect_answer(&mut relay).await;
    let channel = MockChannel::new("web page channel");
    peer.open_channel(&channel);
    peer.report(ConnectivityState::Connected);
    client.handle.send_clip("big.webm", "video/webm", vec![1u8; 200_000]).unwrap();

    client
        .wait_for(|event| {
            matches!(event, UiEvent::Transfer(progress) if progress.state == TransferState::Paused)
        })
        .await;
    let sent_before_close = channel.binary_frames().len();

    channel.close_now();
    client
        .wait_for(|event| {
            matches!(event, UiEvent::Transfer(progress) if matches!(progress.state, TransferState::Failed(_)))
        })
        .await;
    channel.drain(usize::MAX);
    client.status().await;
    assert_eq!(channel.binary_frames().len(), sent_before_close);
}

#[tokio_timeout_test(60, start_paused)]
async fn relay_loss_reconnects_after_fixed_delay_with_a_fresh_session() {
    let mut client = Client::start(ClientConfig::default());
    let mut first_relay = client.connector.next_relay().await.unwrap();
    let first_peer = client.session_ready(1).await;

    first_relay.close();
    client
        .wait_for(|event| *event == UiEvent::Link(LinkState::Idle))
        .await;
    let closed_at = Instant::now();

    let _second_relay = client.connector.next_relay().await.unwrap();
    assert!(closed_at.elapsed() >= Duration::from_secs(5));
    assert_eq!(client.connector.attempts(), 2);

    let second_peer = client.session_ready(2).await;
    assert!(first_peer.negotiator.is_closed());
    assert!(!second_peer.negotiator.is_closed());

    // The timer is gone once the link reopens.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(client.connector.attempts(), 2);

    // Callbacks from the discarded session change nothing.
    first_peer.report(ConnectivityState::Connected);
    let snapshot = client.status().await;
    assert_eq!(snapshot.session, Some(2));
    assert_eq!(snapshot.connectivity, Some(ConnectivityState::New));
}

#[tokio_timeout_test(30, start_paused)]
async fn failed_connects_retry_on_the_same_fixed_delay() {
    let mut client = Client::start(ClientConfig::default());
    // The loop has not run yet, so the very first attempt fails too.
    client.connector.fail_next(2);
    let started = Instant::now();

    let _relay = client.connector.next_relay().await.unwrap();
    client.session_ready(1).await;
    assert_eq!(client.connector.attempts(), 3);
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[tokio_timeout_test(10)]
async fn junk_frames_leave_everything_unchanged() {
    let mut client = Client::start(ClientConfig::default());
    let mut relay = client.connector.next_relay().await.unwrap();
    client.session_ready(1).await;
    let before = client.status().await;

    relay.push("not json at all");
    relay.push(r#"{"type":"bogus","data":{"x":1}}"#);
    relay.push(r#"{"type":"sdp","data":{"type":"rollback"}}"#);
    relay.push("[]");
    let after = client.status().await;

    assert_eq!(before, after);
    assert!(relay.try_next_envelope().is_none());
    assert_eq!(client.peers.created(), 1);
}

#[tokio_timeout_test(10)]
async fn refused_recording_clears_the_flag_and_notifies() {
    let mut client = Client::start(ClientConfig::default());
    let mut relay = client.connector.next_relay().await.unwrap();
    client.session_ready(1).await;

    client.handle.record(true).unwrap();
    assert_eq!(
        relay.next_envelope().await,
        Some(SignalEnvelope::command(RemoteCommand::Record, true))
    );
    assert!(client.status().await.flags.recording);

    relay.push(r#"{"type":"record","data":{"error":"busy"}}"#);
    client
        .wait_for(|event| matches!(event, UiEvent::Notice(text) if text == "Recording thread is already running"))
        .await;
    assert!(!client.status().await.flags.recording);
}

#[tokio_timeout_test(10)]
async fn roster_and_catalog_reach_the_ui() {
    let mut client = Client::start(ClientConfig::default());
    let relay = client.connector.next_relay().await.unwrap();
    client.session_ready(1).await;

    relay.push(r#"{"type":"users","data":[{"name":"ana","indate":"2024-05-01 09:00"}],"ctrls":{"Brightness":{"id":1,"min":-64,"max":64,"type":1,"value":0}}}"#);
    let UiEvent::Catalog(catalog) = client
        .wait_for(|event| matches!(event, UiEvent::Catalog(_)))
        .await
    else {
        unreachable!();
    };
    assert_eq!(catalog["Brightness"].min, 0);
    assert_eq!(catalog["Brightness"].max, 128);
    assert_eq!(catalog["Brightness"].value, Some(64));

    let UiEvent::Roster(users) = client
        .wait_for(|event| matches!(event, UiEvent::Roster(_)))
        .await
    else {
        unreachable!();
    };
    assert_eq!(users[0].name, "ana");
}

#[tokio_timeout_test(10)]
async fn shutdown_closes_the_session_and_stops_the_loop() {
    let mut client = Client::start(ClientConfig::default());
    let _relay = client.connector.next_relay().await.unwrap();
    let peer = client.session_ready(1).await;

    client.handle.shutdown().unwrap();
    client
        .wait_for(|event| *event == UiEvent::Link(LinkState::Shutdown))
        .await;
    client.task.await.unwrap();
    assert!(peer.negotiator.is_closed());
    assert!(client.handle.request_status().is_err());
}
