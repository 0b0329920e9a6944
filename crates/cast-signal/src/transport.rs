use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SignalResult;
use crate::protocol::{ClientId, IceCandidate, SessionDescription};

/// Connection states reported by a media-transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States that end the peer session.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Notifications an endpoint pushes back to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
}

pub type EndpointEvents = mpsc::UnboundedSender<EndpointEvent>;

/// Factory for server-side media endpoints.
///
/// Implementations must wire the endpoint's local-candidate and
/// connection-state notifications into `events` before returning.
#[async_trait]
pub trait MediaTransport: Send + Sync + 'static {
    async fn create_endpoint(
        &self,
        client_id: &ClientId,
        events: EndpointEvents,
    ) -> SignalResult<Arc<dyn TransportEndpoint>>;
}

#[async_trait]
pub trait TransportEndpoint: Send + Sync {
    async fn set_remote_description(&self, description: SessionDescription) -> SignalResult<()>;
    async fn create_answer(&self) -> SignalResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> SignalResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> SignalResult<()>;
    async fn close(&self) -> SignalResult<()>;
}
