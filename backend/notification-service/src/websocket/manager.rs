/// WebSocket Connection Manager
///
/// Routes events to connected clients and tracks deliveries that need an ack.
/// Supports:
/// - Delivery to one connection, every connection of a user, a role, or a channel
/// - At-least-once delivery with bounded retries for `requireAck` messages
/// - Multiple concurrent connections per user
///
/// Per connection, frames are queued in the order the `send_*` calls were made.
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

use super::connection::{Connection, ConnectionId, Frame};
use super::delivery::{PendingAck, RetryOutcome, RetryPolicy, RetryStep};
use super::messages::{events, ServerEnvelope};
use super::registry::ConnectionRegistry;
use crate::auth::Role;
use crate::metrics;

#[derive(Clone)]
pub struct ConnectionManager {
    registry: ConnectionRegistry,
    retry_policy: Arc<RetryPolicy>,
}

impl ConnectionManager {
    pub fn new(registry: ConnectionRegistry, retry_policy: RetryPolicy) -> Self {
        Self {
            registry,
            retry_policy: Arc::new(retry_policy),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Send to a single connection. Returns the message id when the frame was queued.
    pub fn send_to_connection(
        &self,
        connection_id: ConnectionId,
        event: &str,
        data: Value,
        require_ack: bool,
    ) -> Option<String> {
        let mut inner = self.registry.lock();
        match inner.connections.get_mut(&connection_id) {
            Some(connection) => self.deliver(connection, event, data, require_ack),
            None => {
                tracing::debug!(
                    connection_id = %connection_id,
                    event,
                    "dropping message for unknown connection"
                );
                None
            }
        }
    }

    /// Fan out to every connection of `user_id`; each one is tracked independently.
    /// Returns the number of connections the event was queued on.
    pub fn send_to_user(&self, user_id: &str, event: &str, data: Value, require_ack: bool) -> usize {
        let mut inner = self.registry.lock();
        let targets: Vec<ConnectionId> = inner
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for id in targets {
            if let Some(connection) = inner.connections.get_mut(&id) {
                if self.deliver(connection, event, data.clone(), require_ack).is_some() {
                    delivered += 1;
                }
            }
        }

        tracing::debug!(user_id, event, delivered, "sent to user");
        delivered
    }

    pub fn send_to_role(&self, role: Role, event: &str, data: Value, require_ack: bool) -> usize {
        self.send_where(event, data, require_ack, |c| c.identity.role == role)
    }

    pub fn broadcast_to_channel(
        &self,
        channel: &str,
        event: &str,
        data: Value,
        require_ack: bool,
    ) -> usize {
        self.send_where(event, data, require_ack, |c| c.subscriptions.contains(channel))
    }

    /// Deliver once to every connection subscribed to any of `channels`
    pub fn broadcast_to_channels(
        &self,
        channels: &[String],
        event: &str,
        data: Value,
        require_ack: bool,
    ) -> usize {
        self.send_where(event, data, require_ack, |c| {
            channels.iter().any(|ch| c.subscriptions.contains(ch))
        })
    }

    /// Every open connection
    pub fn broadcast(&self, event: &str, data: Value, require_ack: bool) -> usize {
        self.send_where(event, data, require_ack, |_| true)
    }

    pub fn send_connected(&self, connection_id: ConnectionId) -> Option<String> {
        let identity = self.registry.identity(connection_id)?;
        self.send_to_connection(
            connection_id,
            events::CONNECTED,
            json!({
                "connectionId": connection_id,
                "userId": identity.user_id,
                "role": identity.role,
            }),
            false,
        )
    }

    pub fn send_error(&self, connection_id: ConnectionId, code: &str, message: &str) -> Option<String> {
        self.send_to_connection(
            connection_id,
            events::ERROR,
            json!({ "code": code, "message": message }),
            false,
        )
    }

    /// Resolve a pending delivery. Unknown ids are ignored.
    pub fn acknowledge(&self, connection_id: ConnectionId, message_id: &str) -> bool {
        let mut inner = self.registry.lock();
        let Some(connection) = inner.connections.get_mut(&connection_id) else {
            return false;
        };

        match connection.pending.remove(message_id) {
            Some(mut pending) => {
                pending.cancel();
                tracing::debug!(
                    connection_id = %connection_id,
                    message_id,
                    event = %pending.event,
                    retries = pending.retry_count,
                    "delivery acknowledged"
                );
                true
            }
            None => {
                tracing::debug!(connection_id = %connection_id, message_id, "ack for unknown message");
                false
            }
        }
    }

    /// Called when a retry timer fires. Safe to call after the connection is gone.
    pub fn on_retry_due(&self, connection_id: ConnectionId, message_id: &str) -> RetryOutcome {
        let mut inner = self.registry.lock();
        let Some(connection) = inner.connections.get_mut(&connection_id) else {
            return RetryOutcome::Dropped;
        };

        if !connection.is_open() {
            connection.pending.remove(message_id);
            tracing::debug!(
                connection_id = %connection_id,
                message_id,
                "transport closed, dropping pending delivery"
            );
            return RetryOutcome::Dropped;
        }

        let Some(pending) = connection.pending.get_mut(message_id) else {
            return RetryOutcome::Resolved;
        };
        pending.clear_timer();

        let retry_count = match pending.advance(&self.retry_policy) {
            RetryStep::Resend { retry_count } => retry_count,
            RetryStep::Exhausted => {
                let pending = connection.pending.remove(message_id);
                let event = pending.as_ref().map(|p| p.event.as_str()).unwrap_or_default();
                let age_ms = pending
                    .as_ref()
                    .map(|p| (chrono::Utc::now() - p.created_at).num_milliseconds())
                    .unwrap_or_default();
                metrics::delivery_exhausted();
                tracing::error!(
                    connection_id = %connection_id,
                    user_id = %connection.identity.user_id,
                    event,
                    message_id,
                    attempts = self.retry_policy.total_attempts(),
                    age_ms,
                    "delivery failed: retries exhausted without ack"
                );
                return RetryOutcome::Exhausted;
            }
        };

        let envelope = pending.resend_envelope();
        let written = match envelope.to_json() {
            Ok(text) => connection.write(Frame::Text(text)),
            Err(e) => {
                tracing::error!(error = %e, message_id, "failed to serialize resend");
                false
            }
        };

        if !written {
            connection.pending.remove(message_id);
            return RetryOutcome::Dropped;
        }

        let timer = self.schedule_retry(
            connection_id,
            message_id.to_string(),
            self.retry_policy.delay_for(retry_count),
        );
        if let Some(pending) = connection.pending.get_mut(message_id) {
            pending.set_timer(timer);
        }

        metrics::delivery_retried();
        tracing::debug!(
            connection_id = %connection_id,
            message_id,
            event = %envelope.event,
            retry_count,
            "resent unacknowledged message"
        );
        RetryOutcome::Resent { retry_count }
    }

    fn send_where<F>(&self, event: &str, data: Value, require_ack: bool, predicate: F) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        let mut inner = self.registry.lock();
        let mut delivered = 0;
        for connection in inner.connections.values_mut() {
            if connection.is_open()
                && predicate(connection)
                && self.deliver(connection, event, data.clone(), require_ack).is_some()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Serialize, queue, and register a pending ack if requested. Caller holds the registry lock.
    fn deliver(
        &self,
        connection: &mut Connection,
        event: &str,
        data: Value,
        require_ack: bool,
    ) -> Option<String> {
        if !connection.is_open() {
            tracing::debug!(
                connection_id = %connection.id,
                event,
                "transport not open, dropping message"
            );
            return None;
        }

        let envelope = ServerEnvelope::new(event, data, require_ack);
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, event, "failed to serialize envelope");
                return None;
            }
        };

        if !connection.write(Frame::Text(text)) {
            tracing::debug!(connection_id = %connection.id, event, "write failed, dropping message");
            return None;
        }
        metrics::message_sent(event);

        if require_ack {
            let mut pending = PendingAck::new(&envelope);
            pending.set_timer(self.schedule_retry(
                connection.id,
                envelope.message_id.clone(),
                self.retry_policy.delay_for(0),
            ));
            connection.pending.insert(envelope.message_id.clone(), pending);
        }

        Some(envelope.message_id)
    }

    fn schedule_retry(
        &self,
        connection_id: ConnectionId,
        message_id: String,
        delay: Duration,
    ) -> AbortHandle {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.on_retry_due(connection_id, &message_id);
        })
        .abort_handle()
    }
}
