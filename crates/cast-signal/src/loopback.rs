//! In-memory media engine for tests and local development.
//!
//! Endpoints record every call, answer offers with a synthetic SDP and
//! never touch the network. Tests can inject endpoint events, make a
//! stage fail, or hold `set_remote_description` until released.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{NegotiationStage, SignalError, SignalResult};
use crate::protocol::{ClientId, IceCandidate, SessionDescription};
use crate::transport::{
    ConnectionState, EndpointEvent, EndpointEvents, MediaTransport, TransportEndpoint,
};

/// A call observed on a loopback endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointCall {
    SetRemoteDescription(SessionDescription),
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
    Close,
}

#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

#[derive(Default)]
struct LoopbackInner {
    endpoints: Mutex<Vec<Weak<LoopbackEndpoint>>>,
    fail_at: Mutex<Option<NegotiationStage>>,
    remote_gate: Mutex<Option<Arc<Notify>>>,
    next_id: AtomicUsize,
}

pub struct LoopbackEndpoint {
    id: usize,
    client_id: ClientId,
    events: Mutex<Option<EndpointEvents>>,
    calls: Mutex<Vec<EndpointCall>>,
    closed: AtomicBool,
    fail_at: Option<NegotiationStage>,
    remote_gate: Option<Arc<Notify>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next endpoint (or its creation) fail at `stage`.
    pub fn fail_next_at(&self, stage: NegotiationStage) {
        *self.inner.fail_at.lock() = Some(stage);
    }

    /// Makes the next endpoint's `set_remote_description` wait until the
    /// returned notifier fires.
    pub fn hold_next_remote_description(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.inner.remote_gate.lock() = Some(gate.clone());
        gate
    }

    /// Endpoints still referenced by a session or by the caller.
    pub fn endpoints(&self) -> Vec<Arc<LoopbackEndpoint>> {
        self.inner
            .endpoints
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn endpoints_for(&self, client_id: &ClientId) -> Vec<Arc<LoopbackEndpoint>> {
        self.endpoints()
            .into_iter()
            .filter(|endpoint| &endpoint.client_id == client_id)
            .collect()
    }

    pub fn live_endpoints(&self) -> usize {
        self.endpoints()
            .iter()
            .filter(|endpoint| !endpoint.is_closed())
            .count()
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    async fn create_endpoint(
        &self,
        client_id: &ClientId,
        events: EndpointEvents,
    ) -> SignalResult<Arc<dyn TransportEndpoint>> {
        let fail_at = self.inner.fail_at.lock().take();
        if fail_at == Some(NegotiationStage::CreateEndpoint) {
            return Err(SignalError::negotiation(
                NegotiationStage::CreateEndpoint,
                "loopback endpoint creation refused",
            ));
        }
        let endpoint = Arc::new(LoopbackEndpoint {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            client_id: client_id.clone(),
            events: Mutex::new(Some(events)),
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_at,
            remote_gate: self.inner.remote_gate.lock().take(),
        });
        debug!(client_id = %client_id, endpoint = endpoint.id, "loopback endpoint created");
        let mut endpoints = self.inner.endpoints.lock();
        endpoints.retain(|weak| weak.strong_count() > 0);
        endpoints.push(Arc::downgrade(&endpoint));
        drop(endpoints);
        Ok(endpoint)
    }
}

impl LoopbackEndpoint {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn calls(&self) -> Vec<EndpointCall> {
        self.calls.lock().clone()
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                EndpointCall::AddIceCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pushes an event as if the media stack had produced it. Fails once
    /// the endpoint is closed.
    pub fn emit(&self, event: EndpointEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }

    pub fn emit_state(&self, state: ConnectionState) -> bool {
        self.emit(EndpointEvent::ConnectionState(state))
    }

    fn record(&self, call: EndpointCall) {
        self.calls.lock().push(call);
    }

    fn check(&self, stage: NegotiationStage) -> SignalResult<()> {
        if self.is_closed() {
            return Err(SignalError::negotiation(stage, "endpoint closed"));
        }
        if self.fail_at == Some(stage) {
            return Err(SignalError::negotiation(stage, "loopback failure injected"));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportEndpoint for LoopbackEndpoint {
    async fn set_remote_description(&self, description: SessionDescription) -> SignalResult<()> {
        if let Some(gate) = &self.remote_gate {
            gate.notified().await;
        }
        self.check(NegotiationStage::SetRemoteDescription)?;
        self.record(EndpointCall::SetRemoteDescription(description));
        Ok(())
    }

    async fn create_answer(&self) -> SignalResult<SessionDescription> {
        self.check(NegotiationStage::CreateAnswer)?;
        self.record(EndpointCall::CreateAnswer);
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=loopback-{}\r\nt=0 0\r\n",
            self.id, self.client_id
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> SignalResult<()> {
        self.check(NegotiationStage::SetLocalDescription)?;
        self.record(EndpointCall::SetLocalDescription(description));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> SignalResult<()> {
        self.check(NegotiationStage::AddCandidate)?;
        self.record(EndpointCall::AddIceCandidate(candidate));
        Ok(())
    }

    async fn close(&self) -> SignalResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record(EndpointCall::Close);
            // Dropping the sender ends the coordinator's forwarder for this endpoint.
            if let Some(events) = self.events.lock().take() {
                let _ = events.send(EndpointEvent::ConnectionState(ConnectionState::Closed));
            }
        }
        Ok(())
    }
}
