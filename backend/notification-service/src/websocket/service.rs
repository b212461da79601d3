/// Realtime service
///
/// Owns the registry, dispatcher, token verifier and heartbeat task. Built
/// once in `main`, shared with handlers through `web::Data`.
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::connection::{transport, ConnectionId, FrameReceiver};
use super::delivery::{DeliveryPolicy, RetryPolicy};
use super::heartbeat::{self, CLOSE_GOING_AWAY};
use super::manager::ConnectionManager;
use super::registry::ConnectionRegistry;
use crate::auth::{authenticate, AuthError, Identity, JwtVerifier, TokenVerifier};
use crate::config::Config;
use crate::metrics;

pub const SHUTDOWN_REASON: &str = "Server shutting down";

pub struct RealtimeService {
    manager: ConnectionManager,
    verifier: Arc<dyn TokenVerifier>,
    delivery_policy: DeliveryPolicy,
    heartbeat_interval: Duration,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeService {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        retry_policy: RetryPolicy,
        delivery_policy: DeliveryPolicy,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            manager: ConnectionManager::new(ConnectionRegistry::new(), retry_policy),
            verifier,
            delivery_policy,
            heartbeat_interval,
            heartbeat: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(JwtVerifier::new(&config.jwt_secret)),
            config.retry_policy(),
            config.delivery_policy(),
            config.heartbeat_interval(),
        )
    }

    /// Start the heartbeat monitor. Calling it twice keeps the running task.
    pub fn start(&self) {
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.is_some() {
            return;
        }
        *heartbeat = Some(heartbeat::spawn(
            self.manager.registry().clone(),
            self.heartbeat_interval,
        ));
        tracing::info!(
            heartbeat_interval_secs = self.heartbeat_interval.as_secs(),
            max_retries = self.manager.retry_policy().max_retries,
            "realtime service started"
        );
    }

    /// Stop the heartbeat and close every socket with 1001
    pub fn shutdown(&self) -> usize {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        let closed = self
            .manager
            .registry()
            .terminate_all(CLOSE_GOING_AWAY, SHUTDOWN_REASON);
        tracing::info!(closed, "realtime service stopped");
        closed
    }

    pub fn is_running(&self) -> bool {
        self.heartbeat.lock().is_some()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.manager.registry()
    }

    pub fn delivery_policy(&self) -> &DeliveryPolicy {
        &self.delivery_policy
    }

    pub fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        authenticate(self.verifier.as_ref(), token).map_err(|e| {
            metrics::auth_failed(e.kind());
            e
        })
    }

    /// Admit an authenticated socket and queue its `connected` event.
    /// The caller drains the returned receiver onto the socket.
    pub fn connect(&self, identity: Identity) -> (ConnectionId, FrameReceiver) {
        let (sender, receiver) = transport();
        let user_id = identity.user_id.clone();
        let id = self.registry().admit(identity, sender);
        self.manager.send_connected(id);

        tracing::info!(
            connection_id = %id,
            user_id = %user_id,
            user_connections = self.registry().connection_count(&user_id),
            "websocket connected"
        );
        (id, receiver)
    }

    pub fn disconnect(&self, id: ConnectionId) {
        if let Some(identity) = self.registry().remove(id) {
            tracing::info!(
                connection_id = %id,
                user_id = %identity.user_id,
                "websocket disconnected"
            );
        }
    }
}
