use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use metrics::gauge;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use uuid::Uuid;

use crate::membership::Membership;
use crate::protocol::{self, Envelope};

/// A live, authenticated socket as seen by the rest of the relay.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    identity: String,
    sender: mpsc::Sender<Message>,
    membership: Membership,
}

impl ConnectionHandle {
    pub fn new(identity: impl Into<String>, sender: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.into(),
            sender,
            membership: Membership::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Non-blocking enqueue used for fan-out.
    pub fn try_deliver(&self, frame: Message) -> Result<(), TrySendError<Message>> {
        self.sender.try_send(frame)
    }

    /// Enqueues a reply for this connection, waiting for queue space.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        self.sender
            .send(Message::Text(protocol::encode(envelope)))
            .await
            .is_ok()
    }
}

/// Identity -> connection map shared by every socket task.
///
/// At most one connection is kept per identity; admitting a second one
/// supersedes the first without closing it.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    connections: Arc<DashMap<String, Arc<ConnectionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the connection under its identity, returning whatever it replaced.
    pub fn admit(&self, connection: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let previous = self
            .connections
            .insert(connection.identity().to_string(), connection);
        self.record_gauge();
        previous
    }

    /// Like [`admit`](Self::admit) but hands back a guard that releases the
    /// mapping when dropped.
    pub fn admit_scoped(
        &self,
        connection: Arc<ConnectionHandle>,
    ) -> (Admission, Option<Arc<ConnectionHandle>>) {
        let admission = Admission {
            registry: self.clone(),
            identity: connection.identity().to_string(),
            connection_id: connection.id(),
        };
        let previous = self.admit(connection);
        (admission, previous)
    }

    pub fn remove(&self, identity: &str) -> Option<Arc<ConnectionHandle>> {
        let removed = self.connections.remove(identity).map(|(_, conn)| conn);
        if removed.is_some() {
            self.record_gauge();
        }
        removed
    }

    /// Removes the mapping only while it still points at `connection_id`, so a
    /// superseded socket closing late cannot evict its replacement.
    pub fn release(&self, identity: &str, connection_id: Uuid) -> bool {
        let released = self
            .connections
            .remove_if(identity, |_, conn| conn.id() == connection_id)
            .is_some();
        if released {
            self.record_gauge();
        }
        released
    }

    pub fn get(&self, identity: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .get(identity)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Point-in-time copy of every registered connection. No map guard is held
    /// once this returns, so callers may await or mutate the registry freely.
    pub fn connections(&self) -> Vec<(String, Arc<ConnectionHandle>)> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn record_gauge(&self) {
        gauge!("memo_relay_connections_active", self.connections.len() as f64);
    }
}

/// Registry membership for one authenticated socket.
#[must_use = "dropping the admission releases the registry entry"]
pub struct Admission {
    registry: SessionRegistry,
    identity: String,
    connection_id: Uuid,
}

impl Admission {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        let released = self.registry.release(&self.identity, self.connection_id);
        debug!(
            identity = %self.identity,
            connection_id = %self.connection_id,
            released,
            "registry admission dropped"
        );
    }
}
