use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;
use webrtc_ice::udp_network::{EphemeralUDP, UDPNetwork};

use crate::error::{NegotiationStage, SignalError, SignalResult};
use crate::protocol::{ClientId, IceCandidate, SdpType, SessionDescription};
use crate::transport::{
    ConnectionState, EndpointEvent, EndpointEvents, MediaTransport, TransportEndpoint,
};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone)]
pub struct WebRtcEngineConfig {
    pub stun_servers: Vec<String>,
    /// Inclusive UDP port range used for ICE host candidates.
    pub udp_port_range: Option<(u16, u16)>,
    /// Addresses advertised instead of the local interface addresses.
    pub public_ips: Vec<String>,
}

impl Default for WebRtcEngineConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            udp_port_range: None,
            public_ips: Vec::new(),
        }
    }
}

/// Media engine backed by the `webrtc` crate.
pub struct WebRtcEngine {
    api: API,
    config: WebRtcEngineConfig,
}

impl WebRtcEngine {
    pub fn new(config: WebRtcEngineConfig) -> SignalResult<Self> {
        let build_err = |err: webrtc::Error| SignalError::negotiation(NegotiationStage::CreateEndpoint, err);

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(build_err)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(build_err)?;

        let mut setting = SettingEngine::default();
        if let Some((start, end)) = config.udp_port_range {
            match EphemeralUDP::new(start, end) {
                Ok(ephemeral) => setting.set_udp_network(UDPNetwork::Ephemeral(ephemeral)),
                Err(err) => warn!(
                    port_start = start,
                    port_end = end,
                    error = %err,
                    "invalid ICE UDP port range; using defaults"
                ),
            }
        }
        if !config.public_ips.is_empty() {
            setting.set_nat_1to1_ips(config.public_ips.clone(), RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting)
            .build();

        info!(
            stun_servers = ?config.stun_servers,
            udp_port_range = ?config.udp_port_range,
            public_ips = ?config.public_ips,
            "webrtc media engine ready"
        );
        Ok(Self { api, config })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.stun_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaTransport for WebRtcEngine {
    async fn create_endpoint(
        &self,
        client_id: &ClientId,
        events: EndpointEvents,
    ) -> SignalResult<Arc<dyn TransportEndpoint>> {
        let pc = self
            .api
            .new_peer_connection(self.rtc_configuration())
            .await
            .map_err(|err| SignalError::negotiation(NegotiationStage::CreateEndpoint, err))?;
        let pc = Arc::new(pc);

        let ice_events = events.clone();
        let ice_client = client_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = ice_events.clone();
            let client_id = ice_client.clone();
            Box::pin(async move {
                let local = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => IceCandidate::from(init),
                        Err(err) => {
                            warn!(
                                client_id = %client_id,
                                error = %err,
                                "failed to serialize local ICE candidate"
                            );
                            return;
                        }
                    },
                    None => IceCandidate::end_of_candidates(),
                };
                let _ = events.send(EndpointEvent::LocalCandidate(local));
            })
        }));

        let state_events = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = state_events.send(EndpointEvent::ConnectionState(state.into()));
            Box::pin(async {})
        }));

        let track_client = client_id.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let client_id = track_client.clone();
                Box::pin(async move {
                    info!(
                        client_id = %client_id,
                        track_id = %track.id(),
                        kind = ?track.kind(),
                        "remote track started"
                    );
                    tokio::spawn(drain_track(client_id, track));
                })
            },
        ));

        debug!(client_id = %client_id, "webrtc peer connection created");
        Ok(Arc::new(WebRtcEndpoint {
            client_id: client_id.clone(),
            pc,
        }))
    }
}

/// Reads a published track until it ends so the receive pipeline keeps moving.
async fn drain_track(client_id: ClientId, track: Arc<TrackRemote>) {
    let mut packets = 0u64;
    let mut bytes = 0u64;
    while let Ok((packet, _)) = track.read_rtp().await {
        packets += 1;
        bytes += packet.payload.len() as u64;
        counter!("cast_signal_media_packets_total", 1);
    }
    info!(
        client_id = %client_id,
        track_id = %track.id(),
        packets,
        bytes,
        "remote track ended"
    );
}

struct WebRtcEndpoint {
    client_id: ClientId,
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl TransportEndpoint for WebRtcEndpoint {
    async fn set_remote_description(&self, description: SessionDescription) -> SignalResult<()> {
        let stage = NegotiationStage::SetRemoteDescription;
        let description = to_rtc_description(description, stage)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| SignalError::negotiation(stage, err))
    }

    async fn create_answer(&self) -> SignalResult<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| SignalError::negotiation(NegotiationStage::CreateAnswer, err))?;
        from_rtc_description(answer, NegotiationStage::CreateAnswer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> SignalResult<()> {
        let stage = NegotiationStage::SetLocalDescription;
        let description = to_rtc_description(description, stage)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| SignalError::negotiation(stage, err))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> SignalResult<()> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|err| SignalError::negotiation(NegotiationStage::AddCandidate, err))
    }

    async fn close(&self) -> SignalResult<()> {
        debug!(client_id = %self.client_id, "closing webrtc peer connection");
        self.pc
            .close()
            .await
            .map_err(close_error)
    }
}

fn close_error(err: webrtc::Error) -> SignalError {
    SignalError::Transport(format!("close failed: {err}"))
}

fn to_rtc_description(
    description: SessionDescription,
    stage: NegotiationStage,
) -> SignalResult<RTCSessionDescription> {
    let SessionDescription { kind, sdp } = description;
    let parsed = match kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(SignalError::negotiation(
                stage,
                "rollback descriptions are not supported",
            ))
        }
    };
    parsed.map_err(|err| SignalError::negotiation(stage, err))
}

fn from_rtc_description(
    description: RTCSessionDescription,
    stage: NegotiationStage,
) -> SignalResult<SessionDescription> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(SignalError::negotiation(
                stage,
                "engine produced an unspecified description type",
            ))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}
