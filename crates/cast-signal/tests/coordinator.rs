use std::sync::Arc;
use std::time::Duration;

use cast_signal::{
    ChannelHub, ClientId, ClientLink, ConnectionState, CoordinatorConfig, EndpointCall,
    EndpointEvent, IceCandidate, LoopbackTransport, NegotiationStage, Phase, SdpType,
    SessionDescription, SessionRegistry, SignalingCoordinator, SignalingMessage,
    MAX_PENDING_CANDIDATES,
};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    hub: ChannelHub,
    transport: LoopbackTransport,
    coordinator: SignalingCoordinator,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    fn with_config(config: CoordinatorConfig) -> Self {
        let (hub, events) = ChannelHub::new();
        let transport = LoopbackTransport::new();
        let coordinator = SignalingCoordinator::new(
            SessionRegistry::new(),
            Arc::new(transport.clone()),
            Arc::new(hub.clone()),
            config,
        );
        tokio::spawn(coordinator.clone().run(events));
        Self {
            hub,
            transport,
            coordinator,
        }
    }

    fn registry(&self) -> &SessionRegistry {
        self.coordinator.registry()
    }

    fn connect(&self, id: &str) -> ClientLink {
        self.hub
            .connect_with_id(ClientId::from(id))
            .expect("client connects")
    }

    fn send(&self, link: &ClientLink, message: SignalingMessage) {
        self.hub
            .deliver(link.client_id(), message)
            .expect("message delivered");
    }

    async fn handshake(&self, link: &mut ClientLink) {
        self.send(link, SignalingMessage::handshake(link.client_id().as_str()));
        match next(link).await {
            SignalingMessage::HandshakeAck(ack) => {
                assert_eq!(ack.client_id, link.client_id().as_str())
            }
            other => panic!("expected handshake-ack, got {other:?}"),
        }
    }

    async fn offer(&self, link: &mut ClientLink) -> SessionDescription {
        self.send(link, SignalingMessage::offer(offer_sdp()));
        match next(link).await {
            SignalingMessage::Answer(payload) => payload.sdp,
            other => panic!("expected answer, got {other:?}"),
        }
    }

    /// Round-trips a handshake so everything sent before it has been handled.
    async fn settle(&self, link: &mut ClientLink) {
        self.handshake(link).await;
    }
}

fn offer_sdp() -> SessionDescription {
    SessionDescription::offer("v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n")
}

async fn next(link: &mut ClientLink) -> SignalingMessage {
    timeout(WAIT, link.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("client link closed")
}

/// Drains whatever the client still receives and fails on any answer.
async fn assert_no_answer(link: &mut ClientLink) {
    while let Ok(Some(message)) = timeout(Duration::from_millis(50), link.recv()).await {
        assert!(
            !matches!(message, SignalingMessage::Answer(_)),
            "answer sent after teardown"
        );
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn candidate(text: &str) -> IceCandidate {
    IceCandidate {
        candidate: text.to_string(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[tokio::test]
async fn full_session_lifecycle() {
    let harness = Harness::new();
    let mut link = harness.connect("c1");
    let id = link.client_id().clone();

    harness.send(&link, SignalingMessage::handshake("c1"));
    match next(&mut link).await {
        SignalingMessage::HandshakeAck(ack) => {
            assert_eq!(ack.client_id, "c1");
            assert_eq!(ack.message, "Handshake acknowledged for client c1");
        }
        other => panic!("expected handshake-ack, got {other:?}"),
    }

    let answer = harness.offer(&mut link).await;
    assert_eq!(answer.kind, SdpType::Answer);
    assert!(answer.sdp.contains("loopback-c1"));
    assert_eq!(harness.registry().get(&id).expect("session").phase(), Phase::AnswerSent);

    let endpoints = harness.transport.endpoints_for(&id);
    assert_eq!(endpoints.len(), 1);
    let endpoint = endpoints[0].clone();
    assert_eq!(
        endpoint.calls(),
        vec![
            EndpointCall::SetRemoteDescription(offer_sdp()),
            EndpointCall::CreateAnswer,
            EndpointCall::SetLocalDescription(answer),
        ]
    );

    harness.send(&link, SignalingMessage::candidate(IceCandidate::new("")));
    harness.settle(&mut link).await;
    assert!(endpoint.added_candidates().is_empty());

    assert!(endpoint.emit_state(ConnectionState::Connected));
    let registry = harness.registry().clone();
    eventually(|| matches!(registry.get(&id).map(|s| s.phase()), Ok(Phase::Connected))).await;

    harness.hub.disconnect(&id);
    eventually(|| !registry.contains(&id)).await;
    assert!(endpoint.is_closed());
    eventually(|| harness.coordinator.active_workers() == 0).await;
}

#[tokio::test]
async fn candidates_before_offer_are_queued_then_applied_in_order() {
    let harness = Harness::new();
    let mut link = harness.connect("c1");
    let id = link.client_id().clone();

    harness.send(&link, SignalingMessage::candidate(candidate("candidate:x")));
    harness.settle(&mut link).await;

    let session = harness.registry().get(&id).expect("session");
    assert_eq!(session.phase(), Phase::Idle);
    assert_eq!(session.pending_candidates(), 1);
    assert!(harness.transport.endpoints_for(&id).is_empty());

    harness.send(&link, SignalingMessage::candidate(candidate("candidate:y")));
    harness.offer(&mut link).await;

    let endpoint = harness.transport.endpoints_for(&id)[0].clone();
    eventually(|| endpoint.added_candidates().len() == 2).await;

    harness.send(&link, SignalingMessage::candidate(candidate("candidate:z")));
    harness.settle(&mut link).await;

    let applied: Vec<String> = endpoint
        .added_candidates()
        .into_iter()
        .map(|c| c.candidate)
        .collect();
    assert_eq!(applied, vec!["candidate:x", "candidate:y", "candidate:z"]);
    assert_eq!(session.pending_candidates(), 0);
}

#[tokio::test]
async fn duplicate_offer_renegotiates_on_the_same_endpoint() {
    let harness = Harness::new();
    let mut link = harness.connect("c1");
    let id = link.client_id().clone();
    harness.handshake(&mut link).await;

    harness.offer(&mut link).await;
    harness.offer(&mut link).await;

    assert_eq!(harness.transport.endpoints_for(&id).len(), 1);
    assert_eq!(harness.transport.live_endpoints(), 1);
    let remote_sets = harness.transport.endpoints_for(&id)[0]
        .calls()
        .into_iter()
        .filter(|call| matches!(call, EndpointCall::SetRemoteDescription(_)))
        .count();
    assert_eq!(remote_sets, 2);
    assert_eq!(harness.registry().get(&id).expect("session").phase(), Phase::AnswerSent);
}

#[tokio::test]
async fn failed_negotiation_only_tears_down_the_failing_client() {
    let harness = Harness::new();
    let mut a = harness.connect("a");
    let mut b = harness.connect("b");
    let a_id = a.client_id().clone();
    let b_id = b.client_id().clone();
    harness.handshake(&mut a).await;
    harness.handshake(&mut b).await;

    harness
        .transport
        .fail_next_at(NegotiationStage::SetRemoteDescription);
    harness.send(&a, SignalingMessage::offer(offer_sdp()));
    let registry = harness.registry().clone();
    eventually(|| !registry.contains(&a_id)).await;
    assert_eq!(harness.transport.live_endpoints(), 0);

    harness.offer(&mut b).await;
    assert_eq!(registry.get(&b_id).expect("b").phase(), Phase::AnswerSent);

    // A can start over on the same channel.
    harness.handshake(&mut a).await;
    assert_eq!(registry.get(&a_id).expect("a again").phase(), Phase::Idle);
    harness.offer(&mut a).await;
    assert_eq!(registry.get(&a_id).expect("a again").phase(), Phase::AnswerSent);
    assert_eq!(registry.get(&b_id).expect("b").phase(), Phase::AnswerSent);
}

#[tokio::test]
async fn endpoint_creation_failure_tears_down_session() {
    let harness = Harness::new();
    let mut link = harness.connect("c1");
    let id = link.client_id().clone();
    harness.handshake(&mut link).await;

    harness.transport.fail_next_at(NegotiationStage::CreateEndpoint);
    harness.send(&link, SignalingMessage::offer(offer_sdp()));
    let registry = harness.registry().clone();
    eventually(|| !registry.contains(&id)).await;
    assert!(harness.transport.endpoints().is_empty());
}

#[tokio::test]
async fn failed_candidate_tears_down_session() {
    let harness = Harness::new();
    let mut link = harness.connect("c1");
    let id = link.client_id().clone();
    harness.handshake(&mut link).await;

    harness.transport.fail_next_at(NegotiationStage::AddCandidate);
    harness.offer(&mut link).await;
    harness.send(&link, SignalingMessage::candidate(candidate("candidate:1")));

    let registry = harness.registry().clone();
    eventually(|| !registry.contains(&id)).await;
    assert_eq!(harness.transport.live_endpoints(), 0);
}

async fn offer_failing_at(stage: NegotiationStage) {
    let harness = Harness::new();
    let mut link = harness.connect("c1");
    let id = link.client_id().clone();
    harness.handshake(&mut link).await;

    harness.transport.fail_next_at(stage);
    harness.send(&link, SignalingMessage::offer(offer_sdp()));
    let registry = harness.registry().clone();
    eventually(|| !registry.contains(&id)).await;
    assert_eq!(harness.transport.live_endpoints(), 0);
    assert_no_answer(&mut link).await;
}

#[tokio::test]
async fn create_answer_failure_tears_down_without_answering() {
    offer_failing_at(NegotiationStage::CreateAnswer).await;
}

#[tokio::test]
async fn set_local_description_failure_tears_down_without_answering() {
    offer_failing_at(NegotiationStage::SetLocalDescription).await;
}

#[tokio::test]
async fn candidates_past_the_queue_limit_are_dropped() {
    let harness = Harness::new();
    let mut link = harness.connect("c1");
    let id = link.client_id().clone();
    harness.handshake(&mut link).await;

    for n in 0..MAX_PENDING_CANDIDATES + 5 {
        harness.send(
            &link,
            SignalingMessage::candidate(candidate(&format!("candidate:{n}"))),
        );
    }
    harness.settle(&mut link).await;
    let session = harness.registry().get(&id).expect("session");
    assert_eq!(session.pending_candidates(), MAX_PENDING_CANDIDATES);

    harness.offer(&mut link).await;
    let endpoint = harness.transport.endpoints_for(&id)[0].clone();
    eventually(|| endpoint.added_candidates().len() == MAX_PENDING_CANDIDATES).await;
    let last = endpoint.added_candidates().pop().expect("applied candidates");
    assert_eq!(last.candidate, format!("candidate:{}", MAX_PENDING_CANDIDATES - 1));
}

#[tokio::test]
async fn channel_close_mid_negotiation_discards_the_answer() {
    let harness = Harness::new();
    let mut link = harness.connect("c1");
    let id = link.client_id().clone();
    harness.handshake(&mut link).await;

    let gate = harness.transport.hold_next_remote_description();
    harness.send(&link, SignalingMessage::offer(offer_sdp()));
    let transport = harness.transport.clone();
    eventually(|| transport.endpoints_for(&id).len() == 1).await;
    let endpoint = transport.endpoints_for(&id)[0].clone();

    harness.hub.disconnect(&id);
    let registry = harness.registry().clone();
    eventually(|| !registry.contains(&id)).await;
    assert!(endpoint.is_closed());

    gate.notify_one();
    eventually(|| harness.coordinator.active_workers() == 0).await;

    assert!(!registry.contains(&id));
    assert_eq!(endpoint.calls(), vec![EndpointCall::Close]);
    assert_no_answer(&mut link).await;
}

#[tokio::test]
async fn terminal_connection_state_removes_session() {
    let harness = Harness::new();
    let mut link = harness.connect("c1");
    let id = link.client_id().clone();
    harness.handshake(&mut link).await;
    harness.offer(&mut link).await;

    let endpoint = harness.transport.endpoints_for(&id)[0].clone();
    assert!(endpoint.emit_state(ConnectionState::Failed));

    let registry = harness.registry().clone();
    eventually(|| !registry.contains(&id)).await;
    assert!(endpoint.is_closed());
}

#[tokio::test]
async fn stale_endpoint_events_do_not_touch_a_newer_session() {
    let harness = Harness::new();
    let mut first = harness.connect("c1");
    let id = first.client_id().clone();
    harness.handshake(&mut first).await;
    harness.offer(&mut first).await;
    let old_endpoint = harness.transport.endpoints_for(&id)[0].clone();

    harness.hub.disconnect(&id);
    let registry = harness.registry().clone();
    eventually(|| !registry.contains(&id)).await;
    eventually(|| harness.coordinator.active_workers() == 0).await;

    let mut second = harness.connect("c1");
    harness.handshake(&mut second).await;
    harness.offer(&mut second).await;

    assert!(
        !old_endpoint.emit_state(ConnectionState::Failed),
        "closed endpoint still emits events"
    );
    harness.settle(&mut second).await;

    let session = registry.get(&id).expect("newer session survives");
    assert_eq!(session.phase(), Phase::AnswerSent);
    assert_eq!(harness.transport.live_endpoints(), 1);
}

#[tokio::test]
async fn local_candidates_are_forwarded_to_the_client() {
    let harness = Harness::new();
    let mut link = harness.connect("c1");
    let id = link.client_id().clone();
    harness.handshake(&mut link).await;
    harness.offer(&mut link).await;
    let endpoint = harness.transport.endpoints_for(&id)[0].clone();

    let local = candidate("candidate:local 1 udp 1 10.0.0.1 5000 typ host");
    endpoint.emit(EndpointEvent::LocalCandidate(local.clone()));
    assert_eq!(next(&mut link).await, SignalingMessage::candidate(local));

    endpoint.emit(EndpointEvent::LocalCandidate(IceCandidate::end_of_candidates()));
    match next(&mut link).await {
        SignalingMessage::Candidate(payload) => assert!(payload.candidate.is_end_of_candidates()),
        other => panic!("expected candidate, got {other:?}"),
    }
}

#[tokio::test]
async fn answers_from_clients_are_ignored() {
    let harness = Harness::new();
    let mut link = harness.connect("c1");
    let id = link.client_id().clone();
    harness.handshake(&mut link).await;
    harness.offer(&mut link).await;

    harness.send(
        &link,
        SignalingMessage::answer(SessionDescription::answer("v=0\r\n")),
    );
    harness.settle(&mut link).await;

    assert_eq!(harness.registry().get(&id).expect("session").phase(), Phase::AnswerSent);
    assert_eq!(harness.transport.endpoints_for(&id)[0].calls().len(), 3);
}

#[tokio::test]
async fn handshake_ack_echoes_channel_id() {
    let harness = Harness::new();
    let mut link = harness.connect("c1");
    harness.send(&link, SignalingMessage::handshake("someone-else"));
    match next(&mut link).await {
        SignalingMessage::HandshakeAck(ack) => assert_eq!(ack.client_id, "c1"),
        other => panic!("expected handshake-ack, got {other:?}"),
    }
}

#[tokio::test]
async fn reaper_removes_stuck_negotiations() {
    let harness = Harness::with_config(CoordinatorConfig {
        stale_negotiation_timeout: Some(Duration::from_millis(50)),
        reap_interval: Duration::from_millis(20),
    });
    let reaper = harness.coordinator.spawn_reaper().expect("reaper enabled");

    let mut idle = harness.connect("idle");
    let mut stuck = harness.connect("stuck");
    harness.handshake(&mut idle).await;
    harness.handshake(&mut stuck).await;
    harness.offer(&mut stuck).await;

    let registry = harness.registry().clone();
    let stuck_id = stuck.client_id().clone();
    eventually(|| !registry.contains(&stuck_id)).await;
    assert!(registry.contains(idle.client_id()));
    reaper.abort();
}

#[tokio::test]
async fn reaper_is_disabled_by_default() {
    let harness = Harness::new();
    assert!(harness.coordinator.spawn_reaper().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_clients_negotiate_concurrently() {
    let harness = Arc::new(Harness::new());
    let mut tasks = Vec::new();
    for i in 0..16 {
        let harness = harness.clone();
        tasks.push(tokio::spawn(async move {
            let mut link = harness.connect(&format!("client-{i}"));
            harness.handshake(&mut link).await;
            harness.offer(&mut link).await;
            harness.send(&link, SignalingMessage::candidate(candidate("candidate:1")));
            harness.settle(&mut link).await;
            link
        }));
    }
    let mut links = Vec::new();
    for task in tasks {
        links.push(task.await.expect("client task"));
    }

    assert_eq!(harness.registry().len(), 16);
    assert_eq!(harness.transport.live_endpoints(), 16);
    for link in &links {
        let endpoint = harness.transport.endpoints_for(link.client_id())[0].clone();
        assert_eq!(endpoint.added_candidates().len(), 1);
    }
}

#[tokio::test]
async fn reused_client_id_waits_for_the_previous_channel() {
    let harness = Harness::new();
    let mut first = harness.connect("c1");
    let id = first.client_id().clone();
    harness.handshake(&mut first).await;

    let gate = harness.transport.hold_next_remote_description();
    harness.send(&first, SignalingMessage::offer(offer_sdp()));
    let transport = harness.transport.clone();
    eventually(|| transport.endpoints_for(&id).len() == 1).await;

    harness.hub.disconnect(&id);
    let mut second = harness.connect("c1");
    harness.send(&second, SignalingMessage::handshake("c1"));

    // The old channel's offer is still in flight, so the new handshake waits.
    assert!(timeout(Duration::from_millis(100), second.recv()).await.is_err());
    assert_eq!(harness.coordinator.active_workers(), 1);

    gate.notify_one();
    match next(&mut second).await {
        SignalingMessage::HandshakeAck(ack) => assert_eq!(ack.client_id, "c1"),
        other => panic!("expected handshake-ack, got {other:?}"),
    }
    harness.offer(&mut second).await;

    let registry = harness.registry().clone();
    assert_eq!(registry.get(&id).expect("session").phase(), Phase::AnswerSent);
    assert_eq!(transport.live_endpoints(), 1);
    assert_eq!(harness.coordinator.active_workers(), 1);
}

#[tokio::test]
async fn finished_sessions_release_endpoints_and_forwarders() {
    let harness = Harness::new();
    for i in 0..50 {
        let mut link = harness.connect(&format!("client-{i}"));
        harness.handshake(&mut link).await;
        harness.offer(&mut link).await;
        harness.hub.disconnect(link.client_id());
    }

    let registry = harness.registry().clone();
    eventually(|| registry.is_empty() && harness.coordinator.active_workers() == 0).await;
    eventually(|| harness.coordinator.active_forwarders() == 0).await;
    let transport = harness.transport.clone();
    eventually(|| transport.endpoints().is_empty()).await;
}
