use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::delivery::PendingAck;
use crate::auth::Identity;

/// Server-generated id of one live socket, distinct from the user id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What the session actor writes to the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Protocol-level ping used by the heartbeat monitor
    Ping,
    Close { code: u16, reason: String },
}

pub type FrameSender = mpsc::UnboundedSender<Frame>;
pub type FrameReceiver = mpsc::UnboundedReceiver<Frame>;

/// Outbound queue for one connection; the receiver is drained by its session actor
pub fn transport() -> (FrameSender, FrameReceiver) {
    mpsc::unbounded_channel()
}

/// One admitted socket, owned by the registry
pub struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) identity: Identity,
    /// Cleared before each heartbeat ping, set again by the pong
    pub(crate) alive: bool,
    pub(crate) subscriptions: HashSet<String>,
    /// message id -> in-flight delivery
    pub(crate) pending: HashMap<String, PendingAck>,
    pub(crate) connected_at: DateTime<Utc>,
    sender: FrameSender,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, identity: Identity, sender: FrameSender) -> Self {
        Self {
            id,
            identity,
            alive: true,
            subscriptions: HashSet::new(),
            pending: HashMap::new(),
            connected_at: Utc::now(),
            sender,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The session actor drops the receiver when the socket goes away
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Queue a frame; `false` when the transport is no longer open
    pub(crate) fn write(&self, frame: Frame) -> bool {
        self.is_open() && self.sender.send(frame).is_ok()
    }

    /// Abort every retry timer and forget the pending deliveries
    pub(crate) fn cancel_pending(&mut self) -> usize {
        let count = self.pending.len();
        for (_, mut pending) in self.pending.drain() {
            pending.cancel();
        }
        count
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.identity.user_id)
            .field("role", &self.identity.role)
            .field("alive", &self.alive)
            .field("subscriptions", &self.subscriptions)
            .field("pending", &self.pending.len())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn test_write_fails_once_receiver_dropped() {
        let (tx, rx) = transport();
        let conn = Connection::new(
            ConnectionId::new(),
            Identity::new("u1", "", Role::Student),
            tx,
        );

        assert!(conn.write(Frame::Ping));
        drop(rx);
        assert!(!conn.is_open());
        assert!(!conn.write(Frame::Ping));
    }
}
