/// Client control frames
///
/// Applies one inbound text frame to the registry/dispatcher. Malformed or
/// unsupported frames get an `error` event; the socket stays open.
use serde_json::json;

use super::connection::ConnectionId;
use super::manager::ConnectionManager;
use super::messages::{can_subscribe, error_codes, events, normalize_channel, ClientFrame};
use crate::auth::Identity;

/// What a handled frame did, mostly for tests and trace logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Subscribed(String),
    Unsubscribed(String),
    Acked { known: bool },
    Pong,
    Rejected(&'static str),
}

pub fn handle_text_frame(
    manager: &ConnectionManager,
    connection_id: ConnectionId,
    identity: &Identity,
    text: &str,
) -> FrameOutcome {
    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(
                connection_id = %connection_id,
                user_id = %identity.user_id,
                error = %e,
                "invalid client frame"
            );
            manager.send_error(connection_id, error_codes::INVALID_FRAME, "Invalid message format");
            return FrameOutcome::Rejected(error_codes::INVALID_FRAME);
        }
    };

    match frame {
        ClientFrame::Subscribe { payload } => {
            let Some(channel) = normalize_channel(&payload) else {
                manager.send_error(connection_id, error_codes::INVALID_CHANNEL, "Invalid channel name");
                return FrameOutcome::Rejected(error_codes::INVALID_CHANNEL);
            };
            if !can_subscribe(identity, channel) {
                tracing::warn!(
                    connection_id = %connection_id,
                    user_id = %identity.user_id,
                    channel,
                    "subscription to private channel refused"
                );
                manager.send_error(
                    connection_id,
                    error_codes::FORBIDDEN_CHANNEL,
                    "Not allowed to subscribe to this channel",
                );
                return FrameOutcome::Rejected(error_codes::FORBIDDEN_CHANNEL);
            }

            manager.registry().subscribe(connection_id, channel);
            manager.send_to_connection(
                connection_id,
                events::SUBSCRIBED,
                json!({ "channel": channel }),
                false,
            );
            tracing::debug!(connection_id = %connection_id, channel, "subscribed");
            FrameOutcome::Subscribed(channel.to_string())
        }
        ClientFrame::Unsubscribe { payload } => {
            let Some(channel) = normalize_channel(&payload) else {
                manager.send_error(connection_id, error_codes::INVALID_CHANNEL, "Invalid channel name");
                return FrameOutcome::Rejected(error_codes::INVALID_CHANNEL);
            };

            manager.registry().unsubscribe(connection_id, channel);
            manager.send_to_connection(
                connection_id,
                events::UNSUBSCRIBED,
                json!({ "channel": channel }),
                false,
            );
            FrameOutcome::Unsubscribed(channel.to_string())
        }
        ClientFrame::Ack { message_id } => FrameOutcome::Acked {
            known: manager.acknowledge(connection_id, &message_id),
        },
        // application-level only; heartbeat liveness comes from protocol pongs
        ClientFrame::Ping => {
            manager.send_to_connection(
                connection_id,
                events::PONG,
                json!({ "timestamp": chrono::Utc::now().timestamp_millis() }),
                false,
            );
            FrameOutcome::Pong
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::websocket::connection::{transport, Frame, FrameReceiver};
    use crate::websocket::delivery::RetryPolicy;
    use crate::websocket::messages::ServerEnvelope;
    use crate::websocket::registry::ConnectionRegistry;

    fn setup(identity: &Identity) -> (ConnectionManager, ConnectionId, FrameReceiver) {
        let manager = ConnectionManager::new(ConnectionRegistry::new(), RetryPolicy::default());
        let (tx, rx) = transport();
        let id = manager.registry().admit(identity.clone(), tx);
        (manager, id, rx)
    }

    fn next_event(rx: &mut FrameReceiver) -> ServerEnvelope {
        match rx.try_recv().unwrap() {
            Frame::Text(text) => ServerEnvelope::from_json(&text).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let identity = Identity::new("u1", "", Role::Student);
        let (manager, id, mut rx) = setup(&identity);

        let outcome = handle_text_frame(
            &manager,
            id,
            &identity,
            r#"{"type":"subscribe","payload":"course:42"}"#,
        );
        assert_eq!(outcome, FrameOutcome::Subscribed("course:42".into()));
        let reply = next_event(&mut rx);
        assert_eq!(reply.event, events::SUBSCRIBED);
        assert_eq!(reply.data["channel"], "course:42");
        assert_eq!(manager.registry().subscriptions(id), vec!["course:42"]);

        handle_text_frame(
            &manager,
            id,
            &identity,
            r#"{"type":"unsubscribe","payload":"course:42"}"#,
        );
        assert_eq!(next_event(&mut rx).event, events::UNSUBSCRIBED);
        assert!(manager.registry().subscriptions(id).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_event() {
        let identity = Identity::new("u1", "", Role::Student);
        let (manager, id, mut rx) = setup(&identity);

        let outcome = handle_text_frame(&manager, id, &identity, "{not json");
        assert_eq!(outcome, FrameOutcome::Rejected(error_codes::INVALID_FRAME));

        let error = next_event(&mut rx);
        assert_eq!(error.event, events::ERROR);
        assert_eq!(error.data["code"], error_codes::INVALID_FRAME);
        assert!(manager.registry().contains(id));
    }

    #[tokio::test]
    async fn test_foreign_user_channel_refused() {
        let identity = Identity::new("u1", "", Role::Student);
        let (manager, id, mut rx) = setup(&identity);

        let outcome = handle_text_frame(
            &manager,
            id,
            &identity,
            r#"{"type":"subscribe","payload":"user:u2"}"#,
        );
        assert_eq!(outcome, FrameOutcome::Rejected(error_codes::FORBIDDEN_CHANNEL));
        assert_eq!(next_event(&mut rx).data["code"], error_codes::FORBIDDEN_CHANNEL);
        assert!(manager.registry().subscriptions(id).is_empty());
    }

    #[tokio::test]
    async fn test_ack_resolves_pending() {
        let identity = Identity::new("u1", "", Role::Student);
        let (manager, id, mut rx) = setup(&identity);
        let message_id = manager
            .send_to_connection(id, events::NOTIFICATION, json!({}), true)
            .unwrap();
        next_event(&mut rx);

        let ack = format!(r#"{{"type":"ack","messageId":"{}"}}"#, message_id);
        assert_eq!(
            handle_text_frame(&manager, id, &identity, &ack),
            FrameOutcome::Acked { known: true }
        );
        assert_eq!(manager.registry().pending_count(id), 0);

        assert_eq!(
            handle_text_frame(&manager, id, &identity, r#"{"type":"ack","messageId":"nope"}"#),
            FrameOutcome::Acked { known: false }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ping_answers_pong() {
        let identity = Identity::new("u1", "", Role::Admin);
        let (manager, id, mut rx) = setup(&identity);

        assert_eq!(
            handle_text_frame(&manager, id, &identity, r#"{"type":"ping"}"#),
            FrameOutcome::Pong
        );
        assert_eq!(next_event(&mut rx).event, events::PONG);
    }

    #[tokio::test]
    async fn test_json_ping_does_not_count_as_liveness() {
        let identity = Identity::new("u1", "", Role::Student);
        let (manager, id, mut rx) = setup(&identity);

        for _ in 0..3 {
            crate::websocket::heartbeat::sweep(manager.registry());
            handle_text_frame(&manager, id, &identity, r#"{"type":"ping"}"#);
        }

        assert!(!manager.registry().contains(id));
        let frames: Vec<Frame> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(frames.contains(&Frame::Close {
            code: 1001,
            reason: "Heartbeat timeout".into()
        }));
    }
}
