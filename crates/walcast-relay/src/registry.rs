//! Connected clients and change fan-out.
//!
//! The registry owns every connection's [`Session`]. Broadcasts hold the read
//! lock for the whole pass; accept, close and control messages take the
//! write lock, so a broadcast never observes a half-applied change to the
//! connection set.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;
use walcast_core::{AuthPolicy, ChangeEvent, Reply, ServerMessage, Session};

use crate::consumer::EventSink;

pub type ConnectionId = Uuid;

/// A frame queued for one client's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Close the socket after everything queued before it has been sent.
    Close,
}

struct ClientConnection {
    session: Session,
    tx: mpsc::Sender<Outbound>,
}

impl ClientConnection {
    fn enqueue(&self, id: ConnectionId, frame: Outbound) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection = %id, "Client queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection = %id, "Client queue closed, dropping message");
                false
            }
        }
    }

    fn reply(&self, id: ConnectionId, message: &ServerMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.enqueue(id, Outbound::Text(json)),
            Err(e) => {
                warn!(connection = %id, error = %e, "Failed to serialize reply");
                false
            }
        }
    }
}

#[derive(Clone)]
pub struct ClientRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, ClientConnection>>>,
    policy: Arc<AuthPolicy>,
    buffer: usize,
}

impl ClientRegistry {
    pub fn new(policy: AuthPolicy, buffer: usize) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            policy: Arc::new(policy),
            buffer: buffer.max(1),
        }
    }

    pub fn policy(&self) -> &AuthPolicy {
        &self.policy
    }

    /// Add a freshly accepted connection.
    ///
    /// `query_token` is the credential from the handshake, if any. The
    /// greeting (if the policy calls for one) is already queued on the
    /// returned receiver.
    pub async fn register(&self, query_token: Option<&str>) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);
        let (session, greeting) = Session::accept(&self.policy, query_token);
        let connection = ClientConnection { session, tx };

        if let Some(greeting) = greeting {
            connection.reply(id, &greeting);
        }

        let mut connections = self.connections.write().await;
        connections.insert(id, connection);
        debug!(connection = %id, clients = connections.len(), "Client registered");

        (id, rx)
    }

    /// Remove a connection. Returns whether it was registered.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(&id).is_some();
        if removed {
            debug!(connection = %id, clients = connections.len(), "Client unregistered");
        }
        removed
    }

    /// Apply one control frame from `id` and queue the reply.
    ///
    /// Returns `false` once the connection should stop reading, either
    /// because it is unknown or because the reply closes it.
    pub async fn handle_message(&self, id: ConnectionId, text: &str) -> bool {
        let mut connections = self.connections.write().await;
        let Some(connection) = connections.get_mut(&id) else {
            return false;
        };

        match connection.session.handle(&self.policy, text) {
            Reply::Send(message) => {
                connection.reply(id, &message);
                true
            }
            Reply::SendAndClose(message) => {
                debug!(connection = %id, "Rejecting client credential");
                connection.reply(id, &message);
                connection.enqueue(id, Outbound::Close);
                false
            }
        }
    }

    /// Deliver a change to every authenticated connection that wants its
    /// table. Returns the number of clients it was queued for.
    pub async fn broadcast(&self, event: &ChangeEvent) -> usize {
        let payload = match ServerMessage::from(event).to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(lsn = %event.lsn, error = %e, "Failed to serialize change");
                return 0;
            }
        };

        let connections = self.connections.read().await;
        let mut delivered = 0;
        for (id, connection) in connections.iter() {
            if !connection.session.wants(event.table.as_deref()) {
                continue;
            }
            if connection.enqueue(*id, Outbound::Text(payload.clone())) {
                delivered += 1;
            }
        }

        debug!(
            table = event.table.as_deref().unwrap_or("-"),
            kind = %event.kind,
            delivered,
            "Broadcast change"
        );
        delivered
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Snapshot of a connection's session state.
    pub async fn session(&self, id: ConnectionId) -> Option<Session> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|connection| connection.session.clone())
    }
}

impl EventSink for ClientRegistry {
    async fn publish(&self, event: &ChangeEvent) -> usize {
        self.broadcast(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Value};
    use walcast_core::{ChangeKind, Lsn};

    fn event(table: &str) -> ChangeEvent {
        ChangeEvent {
            kind: ChangeKind::Insert,
            schema: Some("public".to_string()),
            table: Some(table.to_string()),
            body: json!({"kind": "insert", "table": table}),
            lsn: Lsn::new(0x10),
            observed_at: Utc::now(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn texts(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
        drain(rx)
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Text(text) => Some(serde_json::from_str(&text).unwrap()),
                Outbound::Close => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_open_policy_registers_authenticated() {
        let registry = ClientRegistry::new(AuthPolicy::open(), 8);
        let (id, mut rx) = registry.register(None).await;

        assert_eq!(registry.len().await, 1);
        assert!(registry.session(id).await.unwrap().is_authenticated());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_secret_policy_greets_with_please_auth() {
        let registry = ClientRegistry::new(AuthPolicy::new(Some("s3cr3t".into())), 8);
        let (id, mut rx) = registry.register(None).await;

        assert!(!registry.session(id).await.unwrap().is_authenticated());
        assert_eq!(
            texts(&mut rx),
            vec![json!({"type": "info", "message": "please_auth"})]
        );
    }

    #[tokio::test]
    async fn test_query_token_authenticates() {
        let registry = ClientRegistry::new(AuthPolicy::new(Some("s3cr3t".into())), 8);
        let (id, mut rx) = registry.register(Some("s3cr3t")).await;

        assert!(registry.session(id).await.unwrap().is_authenticated());
        assert_eq!(
            texts(&mut rx),
            vec![json!({"type": "info", "message": "authenticated_via_query"})]
        );
    }

    #[tokio::test]
    async fn test_broadcast_respects_subscriptions() {
        let registry = ClientRegistry::new(AuthPolicy::open(), 8);
        let (_all, mut all_rx) = registry.register(None).await;
        let (orders, mut orders_rx) = registry.register(None).await;
        let (none, mut none_rx) = registry.register(None).await;

        assert!(
            registry
                .handle_message(orders, r#"{"type":"subscribe","tables":["orders"]}"#)
                .await
        );
        assert!(
            registry
                .handle_message(none, r#"{"type":"unsubscribe","tables":["orders"]}"#)
                .await
        );
        drain(&mut orders_rx);
        drain(&mut none_rx);

        assert_eq!(registry.broadcast(&event("orders")).await, 2);
        assert_eq!(registry.broadcast(&event("users")).await, 1);

        let all: Vec<Value> = texts(&mut all_rx);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["type"], "change");
        assert_eq!(all[1]["table"], "users");

        let only_orders = texts(&mut orders_rx);
        assert_eq!(only_orders.len(), 1);
        assert_eq!(only_orders[0]["table"], "orders");
        assert_eq!(only_orders[0]["kind"], "insert");
        assert_eq!(only_orders[0]["lsn"], "0/10");

        assert!(texts(&mut none_rx).is_empty());
    }

    #[tokio::test]
    async fn test_unauthenticated_receives_nothing() {
        let registry = ClientRegistry::new(AuthPolicy::new(Some("s3cr3t".into())), 8);
        let (id, mut rx) = registry.register(None).await;
        drain(&mut rx);

        assert!(
            registry
                .handle_message(id, r#"{"type":"subscribe","tables":["orders"]}"#)
                .await
        );
        assert_eq!(
            texts(&mut rx),
            vec![json!({"type": "error", "error": "not_authenticated"})]
        );
        assert_eq!(registry.session(id).await.unwrap().subscription(), None);

        assert_eq!(registry.broadcast(&event("orders")).await, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_wrong_token_queues_error_then_close() {
        let registry = ClientRegistry::new(AuthPolicy::new(Some("s3cr3t".into())), 8);
        let (id, mut rx) = registry.register(None).await;
        drain(&mut rx);

        let keep_open = registry
            .handle_message(id, r#"{"type":"auth","token":"nope"}"#)
            .await;
        assert!(!keep_open);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[0],
            Outbound::Text(r#"{"type":"error","error":"invalid_token"}"#.to_string())
        );
        assert_eq!(frames[1], Outbound::Close);
    }

    #[tokio::test]
    async fn test_wrong_token_reports_close_when_queue_is_full() {
        let registry = ClientRegistry::new(AuthPolicy::new(Some("s3cr3t".into())), 1);
        // The greeting occupies the only slot.
        let (id, mut rx) = registry.register(None).await;

        assert!(
            !registry
                .handle_message(id, r#"{"type":"auth","token":"nope"}"#)
                .await
        );
        assert_eq!(
            texts(&mut rx),
            vec![json!({"type": "info", "message": "please_auth"})]
        );
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_others() {
        let registry = ClientRegistry::new(AuthPolicy::open(), 1);
        let (_slow, _slow_rx) = registry.register(None).await;
        let (_fast, mut fast_rx) = registry.register(None).await;

        assert_eq!(registry.broadcast(&event("orders")).await, 2);
        drain(&mut fast_rx);

        // The slow client's single slot is still occupied.
        assert_eq!(registry.broadcast(&event("orders")).await, 1);
        assert_eq!(texts(&mut fast_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let registry = ClientRegistry::new(AuthPolicy::open(), 8);
        let (id, _rx) = registry.register(None).await;

        assert!(registry.unregister(id).await);
        assert!(!registry.unregister(id).await);
        assert!(registry.is_empty().await);
        assert_eq!(registry.broadcast(&event("orders")).await, 0);
        assert!(!registry.handle_message(id, r#"{"type":"auth"}"#).await);
    }
}
