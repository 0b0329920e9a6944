use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{SignalError, SignalResult};
use crate::protocol::ClientId;
use crate::session::{PeerSession, Phase};

/// Process-wide table of live peer sessions, keyed by client id.
///
/// Construct one per server (or per test) and hand clones to whoever
/// needs it; clones share the same table.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: DashMap<ClientId, SessionHandle>,
    next_generation: AtomicU64,
}

/// Shared reference to one registry entry.
///
/// The generation distinguishes successive sessions that reuse a client id.
#[derive(Clone)]
pub struct SessionHandle {
    slot: Arc<SessionSlot>,
}

struct SessionSlot {
    generation: u64,
    session: Mutex<PeerSession>,
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub client_id: ClientId,
    pub generation: u64,
    pub phase: Phase,
    pub pending_candidates: usize,
    pub time_in_phase: Duration,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, client_id: &ClientId) -> SignalResult<SessionHandle> {
        let handle = match self.inner.sessions.entry(client_id.clone()) {
            Entry::Occupied(_) => return Err(SignalError::AlreadyExists(client_id.clone())),
            Entry::Vacant(entry) => {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
                let handle = SessionHandle::new(client_id.clone(), generation);
                entry.insert(handle.clone());
                handle
            }
        };
        // The shard guard is released here; `len()` below reads every shard.
        counter!("cast_signal_sessions_created_total", 1);
        self.publish_active();
        debug!(client_id = %client_id, generation = handle.generation(), "session registered");
        Ok(handle)
    }

    pub fn get(&self, client_id: &ClientId) -> SignalResult<SessionHandle> {
        self.inner
            .sessions
            .get(client_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SignalError::NotFound(client_id.clone()))
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.inner.sessions.contains_key(client_id)
    }

    /// Removes the session for `client_id`, closing its endpoint.
    ///
    /// Returns `false` when there was nothing to remove.
    pub async fn remove(&self, client_id: &ClientId) -> bool {
        let Some((_, handle)) = self.inner.sessions.remove(client_id) else {
            return false;
        };
        self.retire(handle, "removed").await;
        true
    }

    /// Removes the session only if it is still the given generation.
    pub async fn remove_generation(&self, client_id: &ClientId, generation: u64) -> bool {
        let removed = self
            .inner
            .sessions
            .remove_if(client_id, |_, handle| handle.generation() == generation);
        let Some((_, handle)) = removed else {
            return false;
        };
        self.retire(handle, "torn_down").await;
        true
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        // Clone handles first so no shard guard is held while locking sessions.
        let handles: Vec<SessionHandle> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut snapshots: Vec<SessionSnapshot> =
            handles.iter().map(SessionHandle::snapshot).collect();
        snapshots.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        snapshots
    }

    /// Sessions stuck mid-negotiation for longer than `timeout`.
    pub fn stale_negotiations(&self, timeout: Duration) -> Vec<(ClientId, u64)> {
        self.snapshot()
            .into_iter()
            .filter(|snap| snap.phase.is_negotiating() && snap.time_in_phase > timeout)
            .map(|snap| (snap.client_id, snap.generation))
            .collect()
    }

    async fn retire(&self, handle: SessionHandle, reason: &'static str) {
        handle.close().await;
        counter!("cast_signal_sessions_removed_total", 1, "reason" => reason);
        self.publish_active();
        debug!(
            client_id = %handle.client_id(),
            generation = handle.generation(),
            reason,
            "session removed"
        );
    }

    fn publish_active(&self) {
        gauge!("cast_signal_sessions_active", self.inner.sessions.len() as f64);
    }
}

impl SessionHandle {
    fn new(client_id: ClientId, generation: u64) -> Self {
        Self {
            slot: Arc::new(SessionSlot {
                generation,
                session: Mutex::new(PeerSession::new(client_id)),
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.slot.generation
    }

    pub fn client_id(&self) -> ClientId {
        self.lock().client_id().clone()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase()
    }

    pub fn pending_candidates(&self) -> usize {
        self.lock().pending_candidates()
    }

    pub fn has_endpoint(&self) -> bool {
        self.lock().has_endpoint()
    }

    /// Locks the session state. Never hold the guard across an await.
    pub fn lock(&self) -> MutexGuard<'_, PeerSession> {
        self.slot.session.lock()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.lock();
        SessionSnapshot {
            client_id: session.client_id().clone(),
            generation: self.slot.generation,
            phase: session.phase(),
            pending_candidates: session.pending_candidates(),
            time_in_phase: session.time_in_phase(),
        }
    }

    async fn close(&self) {
        let (client_id, endpoint) = {
            let mut session = self.lock();
            (session.client_id().clone(), session.close())
        };
        if let Some(endpoint) = endpoint {
            if let Err(err) = endpoint.close().await {
                warn!(
                    client_id = %client_id,
                    generation = self.slot.generation,
                    error = %err,
                    "failed to close media endpoint"
                );
            }
        }
    }
}
