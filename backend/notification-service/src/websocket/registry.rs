/// Connection Registry
///
/// Holds every admitted connection keyed by connection id, plus the user-id
/// index. Both maps sit behind one mutex so they are never observed out of
/// sync; nothing awaits while the lock is held.
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::connection::{Connection, ConnectionId, Frame, FrameSender};
use crate::auth::Identity;
use crate::metrics;

#[derive(Default)]
pub(crate) struct RegistryInner {
    pub(crate) connections: HashMap<ConnectionId, Connection>,
    pub(crate) by_user: HashMap<String, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn insert(&mut self, connection: Connection) {
        self.by_user
            .entry(connection.identity.user_id.clone())
            .or_default()
            .insert(connection.id);
        self.connections.insert(connection.id, connection);
    }

    /// Detach from both maps, pruning an emptied user entry
    fn detach(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        let user_id = &connection.identity.user_id;
        if let Some(ids) = self.by_user.get_mut(user_id) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_user.remove(user_id);
            }
        }
        Some(connection)
    }
}

/// Snapshot served by the admin stats endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_connections: usize,
    pub unique_users: usize,
    pub by_role: BTreeMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock()
    }

    /// Register an authenticated connection. Sends nothing.
    pub fn admit(&self, identity: Identity, sender: FrameSender) -> ConnectionId {
        let id = ConnectionId::new();
        let user_id = identity.user_id.clone();
        let role = identity.role;

        let user_connections = {
            let mut inner = self.lock();
            inner.insert(Connection::new(id, identity, sender));
            inner.by_user.get(&user_id).map(|ids| ids.len()).unwrap_or(0)
        };

        metrics::connection_opened();
        tracing::debug!(
            connection_id = %id,
            user_id = %user_id,
            role = %role,
            user_connections,
            "connection admitted"
        );
        id
    }

    /// Drop a connection and abort its retry timers. Removing an unknown id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<Identity> {
        let mut connection = self.lock().detach(id)?;
        let cancelled = connection.cancel_pending();

        metrics::connection_closed();
        tracing::debug!(
            connection_id = %id,
            user_id = %connection.identity.user_id,
            cancelled_retries = cancelled,
            "connection removed"
        );
        Some(connection.identity)
    }

    /// Remove the connection and ask its session to close the socket
    pub fn terminate(&self, id: ConnectionId, code: u16, reason: &str) -> bool {
        let Some(mut connection) = self.lock().detach(id) else {
            return false;
        };
        connection.cancel_pending();
        let _ = connection.write(Frame::Close {
            code,
            reason: reason.to_string(),
        });

        metrics::connection_closed();
        tracing::info!(
            connection_id = %id,
            user_id = %connection.identity.user_id,
            code,
            reason,
            "connection terminated"
        );
        true
    }

    /// Close every connection, used on shutdown
    pub fn terminate_all(&self, code: u16, reason: &str) -> usize {
        let ids: Vec<ConnectionId> = self.lock().connections.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.terminate(*id, code, reason))
            .count()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().connections.contains_key(&id)
    }

    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.lock()
            .connections
            .get(&id)
            .map(Connection::is_open)
            .unwrap_or(false)
    }

    pub fn identity(&self, id: ConnectionId) -> Option<Identity> {
        self.lock()
            .connections
            .get(&id)
            .map(|c| c.identity.clone())
    }

    /// Pong received
    pub fn mark_alive(&self, id: ConnectionId) -> bool {
        match self.lock().connections.get_mut(&id) {
            Some(connection) => {
                connection.alive = true;
                true
            }
            None => false,
        }
    }

    /// `true` when the channel was newly added
    pub fn subscribe(&self, id: ConnectionId, channel: &str) -> bool {
        self.lock()
            .connections
            .get_mut(&id)
            .map(|c| c.subscriptions.insert(channel.to_string()))
            .unwrap_or(false)
    }

    /// `true` when the channel was present
    pub fn unsubscribe(&self, id: ConnectionId, channel: &str) -> bool {
        self.lock()
            .connections
            .get_mut(&id)
            .map(|c| c.subscriptions.remove(channel))
            .unwrap_or(false)
    }

    pub fn subscriptions(&self, id: ConnectionId) -> Vec<String> {
        let mut channels: Vec<String> = self
            .lock()
            .connections
            .get(&id)
            .map(|c| c.subscriptions.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    pub fn pending_count(&self, id: ConnectionId) -> usize {
        self.lock()
            .connections
            .get(&id)
            .map(|c| c.pending.len())
            .unwrap_or(0)
    }

    pub fn connection_ids_for_user(&self, user_id: &str) -> Vec<ConnectionId> {
        self.lock()
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.lock().by_user.get(user_id).map(HashSet::len).unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.lock();
        let mut by_role = BTreeMap::new();
        for connection in inner.connections.values() {
            *by_role
                .entry(connection.identity.role.as_str().to_string())
                .or_insert(0) += 1;
        }

        RegistryStats {
            total_connections: inner.connections.len(),
            unique_users: inner.by_user.len(),
            by_role,
        }
    }
}
