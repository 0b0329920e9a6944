use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protocol::{ClientId, IceCandidate};
use crate::transport::TransportEndpoint;

/// Negotiation phase of one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    OfferReceived,
    AnswerSent,
    Connected,
    Closed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::OfferReceived => "offer_received",
            Phase::AnswerSent => "answer_sent",
            Phase::Connected => "connected",
            Phase::Closed => "closed",
        }
    }

    /// Phases in which the client still owes us progress.
    pub fn is_negotiating(self) -> bool {
        matches!(self, Phase::OfferReceived | Phase::AnswerSent)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper bound on remote candidates held before the remote description
/// is set. Browsers trickle a handful per transport.
pub const MAX_PENDING_CANDIDATES: usize = 128;

/// Negotiation state for one client.
///
/// The endpoint is present exactly while the phase is past `Idle` and
/// before `Closed`. Transport calls happen outside the session lock, so
/// callers re-check [`PeerSession::is_closed`] after every await.
pub struct PeerSession {
    client_id: ClientId,
    phase: Phase,
    endpoint: Option<Arc<dyn TransportEndpoint>>,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    phase_since: Instant,
}

impl PeerSession {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            phase: Phase::Idle,
            endpoint: None,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            phase_since: Instant::now(),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn time_in_phase(&self) -> Duration {
        self.phase_since.elapsed()
    }

    pub fn endpoint(&self) -> Option<Arc<dyn TransportEndpoint>> {
        self.endpoint.clone()
    }

    pub fn has_endpoint(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Binds a freshly created endpoint to an idle session.
    ///
    /// Hands the endpoint back when the session can no longer take one so
    /// the caller can close it instead of leaking it.
    pub fn attach_endpoint(
        &mut self,
        endpoint: Arc<dyn TransportEndpoint>,
    ) -> Result<(), Arc<dyn TransportEndpoint>> {
        if self.phase != Phase::Idle || self.endpoint.is_some() {
            return Err(endpoint);
        }
        self.endpoint = Some(endpoint);
        self.set_phase(Phase::OfferReceived);
        Ok(())
    }

    pub fn mark_remote_description_set(&mut self) {
        self.remote_description_set = true;
    }

    /// Records that an answer went out and releases the candidates that
    /// were waiting for the remote description, in receipt order.
    pub fn mark_answer_sent(&mut self) -> Vec<IceCandidate> {
        if self.phase != Phase::Connected {
            self.set_phase(Phase::AnswerSent);
        }
        self.drain_applicable()
    }

    pub fn mark_connected(&mut self) -> Vec<IceCandidate> {
        self.set_phase(Phase::Connected);
        self.drain_applicable()
    }

    /// Whether a remote candidate can go straight to the endpoint.
    pub fn accepts_candidates(&self) -> bool {
        self.remote_description_set && self.endpoint.is_some()
    }

    /// Holds a candidate until the remote description is set. Returns
    /// `false` and drops the candidate once [`MAX_PENDING_CANDIDATES`] are
    /// already waiting.
    pub fn queue_candidate(&mut self, candidate: IceCandidate) -> bool {
        if self.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
            return false;
        }
        self.pending_candidates.push_back(candidate);
        true
    }

    /// Moves the session to `Closed`, dropping queued candidates, and
    /// returns the endpoint so the caller can close it outside the lock.
    pub fn close(&mut self) -> Option<Arc<dyn TransportEndpoint>> {
        self.set_phase(Phase::Closed);
        self.pending_candidates.clear();
        self.remote_description_set = false;
        self.endpoint.take()
    }

    fn drain_applicable(&mut self) -> Vec<IceCandidate> {
        if !self.accepts_candidates() {
            return Vec::new();
        }
        self.pending_candidates.drain(..).collect()
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            self.phase = phase;
            self.phase_since = Instant::now();
        }
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("client_id", &self.client_id)
            .field("phase", &self.phase)
            .field("has_endpoint", &self.endpoint.is_some())
            .field("pending_candidates", &self.pending_candidates.len())
            .field("remote_description_set", &self.remote_description_set)
            .finish()
    }
}
