//! Peer-session signaling core.
//!
//! A browser client opens one signaling channel, says hello with a
//! `handshake`, sends an SDP `offer` and trickles ICE candidates. The
//! [`SignalingCoordinator`] answers from a server-side media endpoint and
//! keeps one [`PeerSession`] per client in the [`SessionRegistry`].
//!
//! Messages for one client are processed strictly in arrival order by a
//! dedicated worker; different clients are handled concurrently.

pub mod channel;
pub mod coordinator;
pub mod error;
pub mod loopback;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod webrtc_engine;

pub use channel::{ChannelEvent, ChannelHub, ClientLink, SignalingChannel};
pub use coordinator::{CoordinatorConfig, SignalingCoordinator};
pub use error::{NegotiationStage, SignalError, SignalResult};
pub use loopback::{EndpointCall, LoopbackEndpoint, LoopbackTransport};
pub use protocol::{
    CandidatePayload, ClientId, HandshakeAckPayload, HandshakePayload, IceCandidate, SdpPayload,
    SdpType, SessionDescription, SignalingMessage,
};
pub use registry::{SessionHandle, SessionRegistry, SessionSnapshot};
pub use session::{PeerSession, Phase, MAX_PENDING_CANDIDATES};
pub use transport::{
    ConnectionState, EndpointEvent, EndpointEvents, MediaTransport, TransportEndpoint,
};
pub use webrtc_engine::{WebRtcEngine, WebRtcEngineConfig};
