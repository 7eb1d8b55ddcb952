//! Broadcast Gateway
//!
//! Fans out session events to the connections attached to a session at
//! publish time. Delivery goes through the [`Transport`] trait so the
//! pipeline never touches a socket; the WebSocket layer subscribes to a
//! [`ChannelTransport`] and tests use a [`MemoryTransport`].

use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::protocol::ServerMessage;
use crate::session::SessionRegistry;

/// Message addressed to a set of connections
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Target connections
    pub recipients: Arc<[Uuid]>,
    /// Server message
    pub message: Arc<ServerMessage>,
}

impl Envelope {
    /// Whether the envelope targets a connection
    #[must_use]
    pub fn is_for(&self, connection_id: Uuid) -> bool {
        self.recipients.contains(&connection_id)
    }
}

/// Delivers messages to transport connections
pub trait Transport: Send + Sync {
    /// Deliver a message to each recipient; returns the number of
    /// recipients the transport accepted it for
    fn deliver(&self, recipients: &[Uuid], message: ServerMessage) -> usize;
}

/// Transport backed by a tokio broadcast channel; every connection task
/// subscribes and keeps the envelopes addressed to it
pub struct ChannelTransport {
    tx: broadcast::Sender<Envelope>,
}

impl ChannelTransport {
    /// Create a transport with the given channel capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe a connection task
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Number of subscribed connection tasks
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Transport for ChannelTransport {
    fn deliver(&self, recipients: &[Uuid], message: ServerMessage) -> usize {
        if recipients.is_empty() {
            return 0;
        }
        let envelope = Envelope {
            recipients: Arc::from(recipients),
            message: Arc::new(message),
        };
        // No subscribers means no connection is open
        match self.tx.send(envelope) {
            Ok(_) => recipients.len(),
            Err(_) => 0,
        }
    }
}

/// Transport that records every delivery in memory
#[derive(Default)]
pub struct MemoryTransport {
    delivered: Mutex<Vec<(Uuid, ServerMessage)>>,
}

impl MemoryTransport {
    /// Create an empty transport
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages delivered to one connection, in delivery order
    #[must_use]
    pub fn messages_for(&self, connection_id: Uuid) -> Vec<ServerMessage> {
        self.delivered
            .lock()
            .map(|delivered| {
                delivered
                    .iter()
                    .filter(|(to, _)| *to == connection_id)
                    .map(|(_, msg)| msg.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove and return everything delivered so far
    #[must_use]
    pub fn take(&self) -> Vec<(Uuid, ServerMessage)> {
        self.delivered
            .lock()
            .map(|mut delivered| std::mem::take(&mut *delivered))
            .unwrap_or_default()
    }
}

impl Transport for MemoryTransport {
    fn deliver(&self, recipients: &[Uuid], message: ServerMessage) -> usize {
        let Ok(mut delivered) = self.delivered.lock() else {
            return 0;
        };
        delivered.extend(recipients.iter().map(|id| (*id, message.clone())));
        recipients.len()
    }
}

/// Publishes session events to the session's current connections
#[derive(Clone)]
pub struct BroadcastGateway {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
}

impl BroadcastGateway {
    /// Create a gateway
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    /// Send to every connection of the session
    pub async fn publish(&self, session_id: &str, message: ServerMessage) -> usize {
        let recipients = self.registry.connections(session_id).await;
        trace!(session_id = %session_id, kind = message.kind(), recipients = recipients.len(), "Publishing");
        self.transport.deliver(&recipients, message)
    }

    /// Send to every connection of the session but one
    pub async fn publish_except(&self, session_id: &str, excluded: Uuid, message: ServerMessage) -> usize {
        let recipients: Vec<Uuid> = self
            .registry
            .connections(session_id)
            .await
            .into_iter()
            .filter(|id| *id != excluded)
            .collect();
        self.transport.deliver(&recipients, message)
    }

    /// Send to an explicit set of connections
    pub fn publish_to(&self, recipients: &[Uuid], message: ServerMessage) -> usize {
        self.transport.deliver(recipients, message)
    }

    /// Send to a single connection
    pub fn send_to(&self, connection_id: Uuid, message: ServerMessage) -> bool {
        self.transport.deliver(&[connection_id], message) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ParticipantRole;

    #[tokio::test]
    async fn test_publish_reaches_session_connections_only() {
        let registry = Arc::new(SessionRegistry::new());
        let transport = Arc::new(MemoryTransport::new());
        let gateway = BroadcastGateway::new(registry.clone(), transport.clone());

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let other = Uuid::new_v4();
        registry.join("s1", "p1", a, ParticipantRole::Contributor).await.unwrap();
        registry.join("s1", "p2", b, ParticipantRole::Contributor).await.unwrap();
        registry.join("s2", "p3", other, ParticipantRole::Contributor).await.unwrap();

        assert_eq!(gateway.publish("s1", ServerMessage::Pong).await, 2);
        assert_eq!(transport.messages_for(a).len(), 1);
        assert_eq!(transport.messages_for(b).len(), 1);
        assert!(transport.messages_for(other).is_empty());

        assert_eq!(gateway.publish_except("s1", a, ServerMessage::Pong).await, 1);
        assert_eq!(transport.messages_for(a).len(), 1);
        assert_eq!(transport.messages_for(b).len(), 2);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_no_history() {
        let registry = Arc::new(SessionRegistry::new());
        let transport = Arc::new(MemoryTransport::new());
        let gateway = BroadcastGateway::new(registry.clone(), transport.clone());

        let early = Uuid::new_v4();
        registry.join("s1", "p1", early, ParticipantRole::Contributor).await.unwrap();
        gateway.publish("s1", ServerMessage::Pong).await;

        let late = Uuid::new_v4();
        registry.join("s1", "p2", late, ParticipantRole::Contributor).await.unwrap();
        assert!(transport.messages_for(late).is_empty());
    }

    #[tokio::test]
    async fn test_channel_transport_addressing() {
        let transport = ChannelTransport::new(8);
        let mut rx = transport.subscribe();
        let target = Uuid::new_v4();

        assert_eq!(transport.deliver(&[target], ServerMessage::Pong), 1);
        let envelope = rx.recv().await.unwrap();
        assert!(envelope.is_for(target));
        assert!(!envelope.is_for(Uuid::new_v4()));
        assert_eq!(envelope.message.kind(), "pong");

        assert_eq!(transport.deliver(&[], ServerMessage::Pong), 0);
    }

    #[test]
    fn test_channel_without_subscribers() {
        let transport = ChannelTransport::new(8);
        assert_eq!(transport.receiver_count(), 0);
        assert_eq!(transport.deliver(&[Uuid::new_v4()], ServerMessage::Pong), 0);
    }
}
