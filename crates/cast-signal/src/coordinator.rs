//! Protocol engine tying channels, sessions and media endpoints together.
//!
//! Each client gets one worker task fed by an unbounded mailbox. Inbound
//! messages, endpoint events and the channel close for that client all
//! pass through the mailbox, so per-client handling is strictly ordered
//! while different clients run in parallel. The session lock is never
//! held across an await; after every transport call the worker re-checks
//! that the session was not torn down in the meantime.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelEvent, SignalingChannel};
use crate::error::{SignalError, SignalResult};
use crate::protocol::{
    ClientId, HandshakeAckPayload, HandshakePayload, IceCandidate, SessionDescription,
    SignalingMessage,
};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::MAX_PENDING_CANDIDATES;
use crate::transport::{ConnectionState, EndpointEvent, MediaTransport, TransportEndpoint};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Sessions negotiating longer than this are reaped. `None` disables
    /// the reaper.
    pub stale_negotiation_timeout: Option<Duration>,
    pub reap_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stale_negotiation_timeout: None,
            reap_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct SignalingCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    registry: SessionRegistry,
    engine: Arc<dyn MediaTransport>,
    channel: Arc<dyn SignalingChannel>,
    workers: DashMap<ClientId, Worker>,
    next_worker: AtomicU64,
    forwarders: AtomicUsize,
    config: CoordinatorConfig,
}

struct Worker {
    id: u64,
    mailbox: mpsc::UnboundedSender<WorkItem>,
}

#[derive(Debug)]
enum WorkItem {
    Opened,
    Inbound(SignalingMessage),
    Endpoint {
        generation: u64,
        event: EndpointEvent,
    },
    Closed,
}

/// Outcome of a negotiation step; `Aborted` means the session was torn
/// down while the step was in flight.
enum Step {
    Done,
    Aborted,
}

impl SignalingCoordinator {
    pub fn new(
        registry: SessionRegistry,
        engine: Arc<dyn MediaTransport>,
        channel: Arc<dyn SignalingChannel>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                registry,
                engine,
                channel,
                workers: DashMap::new(),
                next_worker: AtomicU64::new(0),
                forwarders: AtomicUsize::new(0),
                config,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Number of clients with a live worker.
    pub fn active_workers(&self) -> usize {
        self.inner.workers.len()
    }

    /// Number of endpoint event streams still being forwarded.
    pub fn active_forwarders(&self) -> usize {
        self.inner.forwarders.load(Ordering::SeqCst)
    }

    /// Consumes channel events until the stream ends.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }
        debug!("channel event stream ended");
    }

    /// Routes one channel event to its client's worker, spawning the worker
    /// on first contact.
    pub fn dispatch(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened { client_id } => self.route(client_id, WorkItem::Opened),
            ChannelEvent::Message { client_id, message } => {
                self.route(client_id, WorkItem::Inbound(message))
            }
            ChannelEvent::Closed { client_id } => {
                // Tear down right away so an in-flight negotiation step for this
                // client completes against a removed session.
                if let Ok(handle) = self.inner.registry.get(&client_id) {
                    let registry = self.inner.registry.clone();
                    let id = client_id.clone();
                    let generation = handle.generation();
                    tokio::spawn(async move {
                        registry.remove_generation(&id, generation).await;
                    });
                }
                self.route(client_id, WorkItem::Closed)
            }
        }
    }

    /// Background task removing sessions stuck mid-negotiation. Returns
    /// `None` when no timeout is configured.
    pub fn spawn_reaper(&self) -> Option<JoinHandle<()>> {
        let timeout = self.inner.config.stale_negotiation_timeout?;
        let coordinator = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.reap_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            timeout_secs = timeout.as_secs(),
            interval_secs = self.inner.config.reap_interval.as_secs(),
            "stale negotiation reaper started"
        );
        Some(tokio::spawn(async move {
            loop {
                interval.tick().await;
                coordinator.reap_stale(timeout).await;
            }
        }))
    }

    /// Removes every session negotiating for longer than `timeout`.
    pub async fn reap_stale(&self, timeout: Duration) -> usize {
        let mut reaped = 0;
        for (client_id, generation) in self.inner.registry.stale_negotiations(timeout) {
            if self
                .inner
                .registry
                .remove_generation(&client_id, generation)
                .await
            {
                reaped += 1;
                counter!("cast_signal_sessions_reaped_total", 1);
                info!(client_id = %client_id, generation, "reaped stale negotiation");
            }
        }
        reaped
    }

    fn route(&self, client_id: ClientId, item: WorkItem) {
        let spawn = match self.inner.workers.entry(client_id.clone()) {
            Entry::Occupied(mut entry) => match entry.get().mailbox.send(item) {
                Ok(()) => None,
                Err(mpsc::error::SendError(item)) => {
                    let (worker, mailbox) = self.new_worker(item);
                    let id = worker.id;
                    let _stale = entry.insert(worker);
                    Some((id, mailbox))
                }
            },
            Entry::Vacant(entry) => {
                let (worker, mailbox) = self.new_worker(item);
                let id = worker.id;
                entry.insert(worker);
                Some((id, mailbox))
            }
        };

        if let Some((worker_id, mailbox)) = spawn {
            let coordinator = self.clone();
            tokio::spawn(async move {
                coordinator.run_worker(client_id, worker_id, mailbox).await;
            });
        }
    }

    /// Delivers an endpoint event to the client's current worker, if any.
    fn route_endpoint_event(&self, client_id: &ClientId, generation: u64, event: EndpointEvent) {
        let mailbox = self
            .inner
            .workers
            .get(client_id)
            .map(|worker| worker.mailbox.clone());
        match mailbox {
            Some(mailbox) => {
                let _ = mailbox.send(WorkItem::Endpoint { generation, event });
            }
            None => trace!(client_id = %client_id, generation, "endpoint event without worker"),
        }
    }

    fn new_worker(&self, first: WorkItem) -> (Worker, mpsc::UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(first);
        let worker = Worker {
            id: self.inner.next_worker.fetch_add(1, Ordering::Relaxed),
            mailbox: tx,
        };
        (worker, rx)
    }

    async fn run_worker(
        self,
        client_id: ClientId,
        worker_id: u64,
        mut mailbox: mpsc::UnboundedReceiver<WorkItem>,
    ) {
        trace!(client_id = %client_id, worker_id, "client worker started");
        // Set between a channel close and the next open of the same id.
        let mut closing = false;
        let mut next = mailbox.recv().await;
        while let Some(item) = next {
            match item {
                WorkItem::Closed => closing = true,
                WorkItem::Opened => closing = false,
                _ => {}
            }
            self.handle(&client_id, item).await;
            next = if closing {
                self.release_worker(&client_id, worker_id, &mut mailbox)
            } else {
                mailbox.recv().await
            };
        }
        trace!(client_id = %client_id, worker_id, "client worker stopped");
    }

    /// Unregisters the worker once its mailbox is empty. `route` sends under
    /// the same shard lock, so nothing can slip in between the emptiness
    /// check and the removal. Returns the next queued item otherwise.
    fn release_worker(
        &self,
        client_id: &ClientId,
        worker_id: u64,
        mailbox: &mut mpsc::UnboundedReceiver<WorkItem>,
    ) -> Option<WorkItem> {
        let mut pending = None;
        self.inner.workers.remove_if(client_id, |_, worker| {
            if worker.id != worker_id {
                return false;
            }
            match mailbox.try_recv() {
                Ok(item) => {
                    pending = Some(item);
                    false
                }
                Err(_) => true,
            }
        });
        pending
    }

    async fn handle(&self, client_id: &ClientId, item: WorkItem) {
        match item {
            WorkItem::Opened => self.on_opened(client_id),
            WorkItem::Inbound(message) => self.on_message(client_id, message).await,
            WorkItem::Endpoint { generation, event } => {
                self.on_endpoint_event(client_id, generation, event).await
            }
            WorkItem::Closed => {
                if self.inner.registry.remove(client_id).await {
                    debug!(client_id = %client_id, "session removed on channel close");
                }
            }
        }
    }

    fn on_opened(&self, client_id: &ClientId) {
        match self.inner.registry.create(client_id) {
            Ok(handle) => debug!(
                client_id = %client_id,
                generation = handle.generation(),
                "session created for new channel"
            ),
            Err(err) => warn!(client_id = %client_id, error = %err, "channel opened twice"),
        }
    }

    async fn on_message(&self, client_id: &ClientId, message: SignalingMessage) {
        match message {
            SignalingMessage::Handshake(payload) => self.on_handshake(client_id, payload),
            SignalingMessage::Offer(payload) => self.on_offer(client_id, payload.sdp).await,
            SignalingMessage::Candidate(payload) => {
                self.on_candidate(client_id, payload.candidate).await
            }
            SignalingMessage::Answer(_) => {
                counter!("cast_signal_messages_ignored_total", 1, "kind" => "answer");
                info!(
                    client_id = %client_id,
                    "ignoring answer from client; server-initiated offers are unsupported"
                );
            }
            SignalingMessage::HandshakeAck(_) => {
                counter!("cast_signal_messages_ignored_total", 1, "kind" => "handshake-ack");
                debug!(client_id = %client_id, "ignoring handshake-ack from client");
            }
        }
    }

    fn on_handshake(&self, client_id: &ClientId, payload: HandshakePayload) {
        if payload.client_id != client_id.as_str() {
            debug!(
                client_id = %client_id,
                claimed = %payload.client_id,
                "handshake names a different client id"
            );
        }
        if !self.inner.registry.contains(client_id) {
            match self.inner.registry.create(client_id) {
                Ok(handle) => debug!(
                    client_id = %client_id,
                    generation = handle.generation(),
                    "session created on handshake"
                ),
                Err(SignalError::AlreadyExists(_)) => {}
                Err(err) => warn!(client_id = %client_id, error = %err, "handshake failed"),
            }
        }
        self.send(
            client_id,
            SignalingMessage::HandshakeAck(HandshakeAckPayload::for_client(client_id)),
        );
    }

    async fn on_offer(&self, client_id: &ClientId, offer: SessionDescription) {
        let handle = match self.inner.registry.get(client_id) {
            Ok(handle) => handle,
            Err(err) => {
                counter!("cast_signal_messages_dropped_total", 1, "reason" => err.metric_label());
                warn!(client_id = %client_id, error = %err, "dropping offer");
                return;
            }
        };
        let generation = handle.generation();

        let existing = {
            let session = handle.lock();
            if session.is_closed() {
                return;
            }
            session.endpoint()
        };

        let endpoint = match existing {
            Some(endpoint) => {
                debug!(
                    client_id = %client_id,
                    generation,
                    phase = %handle.phase(),
                    "renegotiating on existing endpoint"
                );
                endpoint
            }
            None => match self.open_endpoint(client_id, &handle).await {
                Ok(Some(endpoint)) => endpoint,
                Ok(None) => return,
                Err(err) => {
                    self.fail(client_id, generation, err).await;
                    return;
                }
            },
        };

        match self.negotiate(client_id, &handle, endpoint, offer).await {
            Ok(Step::Done) => {}
            Ok(Step::Aborted) => debug!(
                client_id = %client_id,
                generation,
                "negotiation finished after teardown"
            ),
            Err(err) => self.fail(client_id, generation, err).await,
        }
    }

    /// Creates an endpoint and binds it to the session. Returns `None` when
    /// the session was torn down while the endpoint was being created.
    async fn open_endpoint(
        &self,
        client_id: &ClientId,
        handle: &SessionHandle,
    ) -> SignalResult<Option<Arc<dyn TransportEndpoint>>> {
        let generation = handle.generation();
        let (events, events_rx) = mpsc::unbounded_channel();
        let endpoint = self.inner.engine.create_endpoint(client_id, events).await?;
        self.spawn_event_forwarder(client_id.clone(), generation, events_rx);

        let rejected = handle.lock().attach_endpoint(endpoint.clone()).err();
        if let Some(endpoint) = rejected {
            debug!(client_id = %client_id, generation, "session gone before endpoint attached");
            if let Err(err) = endpoint.close().await {
                warn!(client_id = %client_id, error = %err, "failed to close orphaned endpoint");
            }
            return Ok(None);
        }
        debug!(client_id = %client_id, generation, "media endpoint attached");
        Ok(Some(endpoint))
    }

    fn spawn_event_forwarder(
        &self,
        client_id: ClientId,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<EndpointEvent>,
    ) {
        let coordinator = self.clone();
        self.inner.forwarders.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                coordinator.route_endpoint_event(&client_id, generation, event);
            }
            coordinator.inner.forwarders.fetch_sub(1, Ordering::SeqCst);
            trace!(client_id = %client_id, generation, "endpoint event stream ended");
        });
    }

    async fn negotiate(
        &self,
        client_id: &ClientId,
        handle: &SessionHandle,
        endpoint: Arc<dyn TransportEndpoint>,
        offer: SessionDescription,
    ) -> SignalResult<Step> {
        endpoint.set_remote_description(offer).await?;
        {
            let mut session = handle.lock();
            if session.is_closed() {
                return Ok(Step::Aborted);
            }
            session.mark_remote_description_set();
        }

        let answer = endpoint.create_answer().await?;
        endpoint.set_local_description(answer.clone()).await?;

        let released = {
            let mut session = handle.lock();
            if session.is_closed() {
                return Ok(Step::Aborted);
            }
            session.mark_answer_sent()
        };
        self.send(client_id, SignalingMessage::answer(answer));
        debug!(
            client_id = %client_id,
            generation = handle.generation(),
            released = released.len(),
            "answer sent"
        );

        self.apply_candidates(handle, &endpoint, released).await
    }

    async fn apply_candidates(
        &self,
        handle: &SessionHandle,
        endpoint: &Arc<dyn TransportEndpoint>,
        candidates: Vec<IceCandidate>,
    ) -> SignalResult<Step> {
        for candidate in candidates {
            if handle.lock().is_closed() {
                return Ok(Step::Aborted);
            }
            endpoint.add_ice_candidate(candidate).await?;
            counter!("cast_signal_candidates_total", 1, "outcome" => "applied");
        }
        Ok(Step::Done)
    }

    async fn on_candidate(&self, client_id: &ClientId, candidate: IceCandidate) {
        if candidate.is_end_of_candidates() {
            counter!("cast_signal_candidates_total", 1, "outcome" => "end_of_candidates");
            debug!(client_id = %client_id, "remote end-of-candidates");
            return;
        }
        let handle = match self.inner.registry.get(client_id) {
            Ok(handle) => handle,
            Err(err) => {
                counter!("cast_signal_candidates_total", 1, "outcome" => "dropped");
                debug!(client_id = %client_id, error = %err, "dropping candidate");
                return;
            }
        };

        let endpoint = {
            let mut session = handle.lock();
            if session.is_closed() {
                return;
            }
            if session.accepts_candidates() {
                session.endpoint()
            } else if session.queue_candidate(candidate.clone()) {
                None
            } else {
                drop(session);
                counter!("cast_signal_candidates_total", 1, "outcome" => "overflow");
                warn!(
                    client_id = %client_id,
                    limit = MAX_PENDING_CANDIDATES,
                    "pending candidate queue full; dropping candidate"
                );
                return;
            }
        };

        let Some(endpoint) = endpoint else {
            counter!("cast_signal_candidates_total", 1, "outcome" => "queued");
            trace!(
                client_id = %client_id,
                pending = handle.pending_candidates(),
                "candidate queued until remote description is set"
            );
            return;
        };

        match self.apply_candidates(&handle, &endpoint, vec![candidate]).await {
            Ok(_) => {}
            Err(err) => self.fail(client_id, handle.generation(), err).await,
        }
    }

    async fn on_endpoint_event(&self, client_id: &ClientId, generation: u64, event: EndpointEvent) {
        let handle = match self.inner.registry.get(client_id) {
            Ok(handle) if handle.generation() == generation => handle,
            _ => {
                trace!(client_id = %client_id, generation, "stale endpoint event");
                return;
            }
        };

        match event {
            EndpointEvent::LocalCandidate(candidate) => {
                if handle.lock().is_closed() {
                    return;
                }
                self.send(client_id, SignalingMessage::candidate(candidate));
            }
            EndpointEvent::ConnectionState(ConnectionState::Connected) => {
                let flushed = {
                    let mut session = handle.lock();
                    if session.is_closed() {
                        return;
                    }
                    let released = session.mark_connected();
                    session.endpoint().map(|endpoint| (endpoint, released))
                };
                info!(client_id = %client_id, generation, "peer connected");
                counter!("cast_signal_connections_established_total", 1);
                if let Some((endpoint, released)) = flushed {
                    if let Err(err) = self.apply_candidates(&handle, &endpoint, released).await {
                        self.fail(client_id, generation, err).await;
                    }
                }
            }
            EndpointEvent::ConnectionState(state) if state.is_terminal() => {
                if self
                    .inner
                    .registry
                    .remove_generation(client_id, generation)
                    .await
                {
                    counter!("cast_signal_connections_lost_total", 1, "state" => state.as_str());
                    info!(
                        client_id = %client_id,
                        generation,
                        state = state.as_str(),
                        "peer connection ended; session removed"
                    );
                }
            }
            EndpointEvent::ConnectionState(state) => {
                debug!(client_id = %client_id, generation, state = state.as_str(), "connection state");
            }
        }
    }

    async fn fail(&self, client_id: &ClientId, generation: u64, err: SignalError) {
        let stage = match &err {
            SignalError::Negotiation { stage, .. } => stage.metric_label(),
            other => other.metric_label(),
        };
        if self
            .inner
            .registry
            .remove_generation(client_id, generation)
            .await
        {
            counter!("cast_signal_negotiation_failures_total", 1, "stage" => stage);
            warn!(
                client_id = %client_id,
                generation,
                stage,
                error = %err,
                "negotiation failed; session torn down"
            );
        } else {
            debug!(
                client_id = %client_id,
                generation,
                error = %err,
                "negotiation step failed after teardown"
            );
        }
    }

    fn send(&self, client_id: &ClientId, message: SignalingMessage) {
        match self.inner.channel.send(client_id, message) {
            Ok(()) => {}
            Err(SignalError::ChannelClosed(_)) => {
                trace!(client_id = %client_id, "send skipped; channel closed")
            }
            Err(err) => warn!(client_id = %client_id, error = %err, "send failed"),
        }
    }
}

