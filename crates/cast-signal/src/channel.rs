//! Per-client message channels between the wire transport and the
//! coordinator.
//!
//! The hub owns one outbound queue per connected client and a single
//! event stream of opens, inbound messages and closes. A websocket
//! handler (or a test) holds the [`ClientLink`] for its client and pumps
//! frames in both directions.

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{SignalError, SignalResult};
use crate::protocol::{ClientId, SignalingMessage};

/// Outbound side of the signaling transport.
pub trait SignalingChannel: Send + Sync + 'static {
    /// Queues `message` for delivery to `client_id`.
    fn send(&self, client_id: &ClientId, message: SignalingMessage) -> SignalResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened {
        client_id: ClientId,
    },
    Message {
        client_id: ClientId,
        message: SignalingMessage,
    },
    Closed {
        client_id: ClientId,
    },
}

impl ChannelEvent {
    pub fn client_id(&self) -> &ClientId {
        match self {
            ChannelEvent::Opened { client_id }
            | ChannelEvent::Message { client_id, .. }
            | ChannelEvent::Closed { client_id } => client_id,
        }
    }
}

#[derive(Clone)]
pub struct ChannelHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    clients: DashMap<ClientId, mpsc::UnboundedSender<SignalingMessage>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

/// One client's end of the hub: the queue of messages addressed to it.
#[derive(Debug)]
pub struct ClientLink {
    client_id: ClientId,
    outbound: mpsc::UnboundedReceiver<SignalingMessage>,
}

impl ChannelHub {
    /// Creates a hub and the event stream the coordinator consumes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let hub = Self {
            inner: Arc::new(HubInner {
                clients: DashMap::new(),
                events,
            }),
        };
        (hub, rx)
    }

    /// Registers a new client under a freshly generated id.
    pub fn connect(&self) -> ClientLink {
        loop {
            if let Ok(link) = self.connect_with_id(ClientId::generate()) {
                return link;
            }
        }
    }

    /// Registers a client under a caller-chosen id. An id may be reused
    /// once its previous channel is disconnected; the coordinator finishes
    /// the old channel's work before starting on the new one.
    pub fn connect_with_id(&self, client_id: ClientId) -> SignalResult<ClientLink> {
        let (tx, outbound) = mpsc::unbounded_channel();
        match self.inner.clients.entry(client_id.clone()) {
            Entry::Occupied(_) => return Err(SignalError::AlreadyExists(client_id)),
            Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }
        counter!("cast_signal_channels_opened_total", 1);
        debug!(client_id = %client_id, "signaling channel opened");
        self.emit(ChannelEvent::Opened {
            client_id: client_id.clone(),
        });
        Ok(ClientLink {
            client_id,
            outbound,
        })
    }

    /// Hands a decoded inbound message to the coordinator.
    pub fn deliver(&self, client_id: &ClientId, message: SignalingMessage) -> SignalResult<()> {
        if !self.inner.clients.contains_key(client_id) {
            return Err(SignalError::ChannelClosed(client_id.clone()));
        }
        trace!(client_id = %client_id, kind = message.kind(), "inbound signaling message");
        counter!("cast_signal_messages_in_total", 1, "kind" => message.kind());
        self.emit(ChannelEvent::Message {
            client_id: client_id.clone(),
            message,
        });
        Ok(())
    }

    /// Decodes a text frame and delivers it. Malformed frames are counted
    /// and returned as errors without closing the channel.
    pub fn deliver_text(&self, client_id: &ClientId, text: &str) -> SignalResult<()> {
        match SignalingMessage::decode(text) {
            Ok(message) => self.deliver(client_id, message),
            Err(err) => {
                counter!("cast_signal_messages_rejected_total", 1, "reason" => err.metric_label());
                Err(err)
            }
        }
    }

    /// Drops the client's outbound queue and reports the close once.
    pub fn disconnect(&self, client_id: &ClientId) -> bool {
        if self.inner.clients.remove(client_id).is_none() {
            return false;
        }
        counter!("cast_signal_channels_closed_total", 1);
        debug!(client_id = %client_id, "signaling channel closed");
        self.emit(ChannelEvent::Closed {
            client_id: client_id.clone(),
        });
        true
    }

    pub fn is_connected(&self, client_id: &ClientId) -> bool {
        self.inner.clients.contains_key(client_id)
    }

    pub fn connected(&self) -> usize {
        self.inner.clients.len()
    }

    fn emit(&self, event: ChannelEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("channel event dropped; coordinator is gone");
        }
    }
}

impl SignalingChannel for ChannelHub {
    fn send(&self, client_id: &ClientId, message: SignalingMessage) -> SignalResult<()> {
        let kind = message.kind();
        let sender = self
            .inner
            .clients
            .get(client_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SignalError::ChannelClosed(client_id.clone()))?;
        sender
            .send(message)
            .map_err(|_| SignalError::ChannelClosed(client_id.clone()))?;
        counter!("cast_signal_messages_out_total", 1, "kind" => kind);
        Ok(())
    }
}

impl ClientLink {
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Next message addressed to this client, or `None` once the hub
    /// dropped the queue.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalingMessage> {
        self.outbound.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HandshakeAckPayload, IceCandidate};

    #[tokio::test]
    async fn connect_reports_open_and_routes_outbound() {
        let (hub, mut events) = ChannelHub::new();
        let mut link = hub.connect();
        let id = link.client_id().clone();
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Opened {
                client_id: id.clone()
            })
        );

        let ack = SignalingMessage::HandshakeAck(HandshakeAckPayload::for_client(&id));
        hub.send(&id, ack.clone()).expect("send");
        assert_eq!(link.recv().await, Some(ack));
    }

    #[tokio::test]
    async fn messages_for_other_clients_are_not_observed() {
        let (hub, _events) = ChannelHub::new();
        let mut a = hub.connect_with_id(ClientId::from("a")).expect("a");
        let mut b = hub.connect_with_id(ClientId::from("b")).expect("b");
        hub.send(
            &ClientId::from("b"),
            SignalingMessage::candidate(IceCandidate::new("candidate:1")),
        )
        .expect("send");
        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_some());
    }

    #[tokio::test]
    async fn disconnect_closes_once_and_rejects_later_sends() {
        let (hub, mut events) = ChannelHub::new();
        let mut link = hub.connect_with_id(ClientId::from("c1")).expect("connect");
        let id = link.client_id().clone();
        let _ = events.recv().await;

        assert!(hub.disconnect(&id));
        assert!(!hub.disconnect(&id));
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Closed {
                client_id: id.clone()
            })
        );
        assert!(events.try_recv().is_err());
        assert!(matches!(
            hub.send(&id, SignalingMessage::handshake("c1")),
            Err(SignalError::ChannelClosed(_))
        ));
        assert!(matches!(
            hub.deliver(&id, SignalingMessage::handshake("c1")),
            Err(SignalError::ChannelClosed(_))
        ));
        assert_eq!(link.recv().await, None);
    }

    #[tokio::test]
    async fn malformed_text_is_rejected_without_closing() {
        let (hub, mut events) = ChannelHub::new();
        let link = hub.connect_with_id(ClientId::from("c1")).expect("connect");
        let _ = events.recv().await;

        assert!(matches!(
            hub.deliver_text(link.client_id(), "{not json"),
            Err(SignalError::Malformed(_))
        ));
        assert!(hub.is_connected(link.client_id()));
        hub.deliver_text(
            link.client_id(),
            r#"{"type":"handshake","payload":{"clientId":"c1"}}"#,
        )
        .expect("valid frame");
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Message { .. })
        ));
    }

    #[test]
    fn duplicate_ids_are_refused() {
        let (hub, _events) = ChannelHub::new();
        let _first = hub.connect_with_id(ClientId::from("c1")).expect("first");
        assert!(matches!(
            hub.connect_with_id(ClientId::from("c1")),
            Err(SignalError::AlreadyExists(_))
        ));
        assert_eq!(hub.connected(), 1);
    }
}
