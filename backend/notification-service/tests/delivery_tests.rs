/// Realtime delivery scenarios
///
/// Time is paused so the 1s/3s/10s resend schedule and the heartbeat
/// interval run deterministically.
use realtime_notification_service::auth::{
    AuthError, Identity, JwtVerifier, Role, CLOSE_INVALID_TOKEN, CLOSE_MISSING_TOKEN,
    CLOSE_TOKEN_EXPIRED,
};
use realtime_notification_service::websocket::protocol::handle_text_frame;
use realtime_notification_service::websocket::{
    ConnectionId, DeliveryPolicy, Frame, FrameReceiver, RealtimeService, RetryPolicy,
    ServerEnvelope,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const SECRET: &str = "delivery-test-secret-0123456789";

fn service() -> RealtimeService {
    RealtimeService::new(
        Arc::new(JwtVerifier::new(SECRET)),
        RetryPolicy::default(),
        DeliveryPolicy::default(),
        Duration::from_secs(30),
    )
}

fn connect(service: &RealtimeService, user_id: &str) -> (ConnectionId, Identity, FrameReceiver) {
    let identity = Identity::new(user_id, "", Role::Student);
    let (id, mut rx) = service.connect(identity.clone());
    match rx.try_recv() {
        Ok(Frame::Text(text)) => {
            assert_eq!(ServerEnvelope::from_json(&text).unwrap().event, "connected")
        }
        other => panic!("expected connected event, got {:?}", other),
    }
    (id, identity, rx)
}

fn drain(rx: &mut FrameReceiver) -> Vec<ServerEnvelope> {
    let mut out = vec![];
    while let Ok(frame) = rx.try_recv() {
        if let Frame::Text(text) = frame {
            out.push(ServerEnvelope::from_json(&text).unwrap());
        }
    }
    out
}

async fn sleep_until_ms(start: Instant, ms: u64) {
    tokio::time::sleep_until(start + Duration::from_millis(ms)).await;
}

#[test]
fn test_connection_refused_with_close_codes() {
    let service = service();
    let identity = Identity::new("u1", "", Role::Student);

    let missing = service.authenticate(None).unwrap_err();
    assert_eq!(missing.close_code(), CLOSE_MISSING_TOKEN);

    let garbage = service.authenticate(Some("not-a-jwt")).unwrap_err();
    assert_eq!(garbage.close_code(), CLOSE_INVALID_TOKEN);

    let expired = JwtVerifier::new(SECRET)
        .issue_token(&identity, chrono::Duration::hours(-1))
        .unwrap();
    assert_eq!(
        service.authenticate(Some(&expired)),
        Err(AuthError::Expired)
    );
    assert_eq!(AuthError::Expired.close_code(), CLOSE_TOKEN_EXPIRED);

    assert_eq!(service.registry().total_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_acked_message_is_never_resent() {
    let service = service();
    let (id, identity, mut rx) = connect(&service, "u1");

    let delivered = service
        .manager()
        .send_to_user("u1", "notification", json!({"title": "Grade posted"}), true);
    assert_eq!(delivered, 1);

    let sent = drain(&mut rx);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data["title"], "Grade posted");

    let ack = format!(r#"{{"type":"ack","messageId":"{}"}}"#, sent[0].message_id);
    handle_text_frame(service.manager(), id, &identity, &ack);
    assert_eq!(service.registry().pending_count(id), 0);

    sleep(Duration::from_secs(60)).await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unacked_message_resent_on_schedule_then_exhausted() {
    let service = service();
    let (id, _identity, mut rx) = connect(&service, "u1");
    let start = Instant::now();

    let message_id = service
        .manager()
        .send_to_connection(id, "notification", json!({"title": "Grade posted"}), true)
        .unwrap();
    assert_eq!(drain(&mut rx).len(), 1);

    sleep_until_ms(start, 900).await;
    assert!(drain(&mut rx).is_empty());

    // resends at t = 1s, 4s, 14s
    for (at_ms, retry_count) in [(1_100, 1), (4_100, 2), (14_100, 3)] {
        sleep_until_ms(start, at_ms).await;
        let resent = drain(&mut rx);
        assert_eq!(resent.len(), 1, "one resend by {}ms", at_ms);
        assert_eq!(resent[0].message_id, message_id);
        assert_eq!(resent[0].retry_count, Some(retry_count));
        assert_eq!(resent[0].data["title"], "Grade posted");
        assert_eq!(service.registry().pending_count(id), 1);
    }

    // exhaustion check waits the last backoff again (t = 24s)
    sleep_until_ms(start, 23_900).await;
    assert_eq!(service.registry().pending_count(id), 1);
    sleep_until_ms(start, 24_100).await;
    assert_eq!(service.registry().pending_count(id), 0);

    sleep(Duration::from_secs(120)).await;
    assert!(drain(&mut rx).is_empty());
    assert!(service.registry().contains(id));
}

#[tokio::test(start_paused = true)]
async fn test_ack_after_first_resend_stops_retries() {
    let service = service();
    let (id, identity, mut rx) = connect(&service, "u1");

    service
        .manager()
        .send_to_connection(id, "result:published", json!({"score": 91}), true);
    drain(&mut rx);

    sleep(Duration::from_millis(1_500)).await;
    let resent = drain(&mut rx);
    assert_eq!(resent.len(), 1);

    let ack = format!(r#"{{"type":"ack","messageId":"{}"}}"#, resent[0].message_id);
    handle_text_frame(service.manager(), id, &identity, &ack);

    sleep(Duration::from_secs(60)).await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_remove_cancels_pending_timers() {
    let service = service();
    let (id, _identity, mut rx) = connect(&service, "u1");

    service
        .manager()
        .send_to_connection(id, "notification", json!({}), true);
    drain(&mut rx);

    service.disconnect(id);
    service.disconnect(id);

    sleep(Duration::from_secs(60)).await;
    assert!(drain(&mut rx).is_empty());
    assert!(!service.registry().contains(id));
}

#[tokio::test(start_paused = true)]
async fn test_send_to_user_tracks_each_connection() {
    let service = service();
    let (first, identity, mut rx1) = connect(&service, "u1");
    let (second, _, mut rx2) = connect(&service, "u1");

    assert_eq!(
        service
            .manager()
            .send_to_user("u1", "notification", json!({"n": 1}), true),
        2
    );
    let on_first = drain(&mut rx1);
    drain(&mut rx2);

    // only the first tab acks
    let ack = format!(r#"{{"type":"ack","messageId":"{}"}}"#, on_first[0].message_id);
    handle_text_frame(service.manager(), first, &identity, &ack);

    sleep(Duration::from_millis(1_100)).await;
    assert!(drain(&mut rx1).is_empty());
    assert_eq!(drain(&mut rx2).len(), 1);
    assert_eq!(service.registry().pending_count(second), 1);
}

#[tokio::test]
async fn test_channel_subscription_scenario() {
    let service = service();
    let (id, identity, mut rx) = connect(&service, "u1");
    let (_, _, mut other_rx) = connect(&service, "u2");

    handle_text_frame(
        service.manager(),
        id,
        &identity,
        r#"{"type":"subscribe","payload":"course:42"}"#,
    );
    let subscribed = drain(&mut rx);
    assert_eq!(subscribed[0].event, "subscribed");

    let delivered = service.manager().broadcast_to_channel(
        "course:42",
        "announcement:new",
        json!({"title": "Quiz Friday"}),
        false,
    );
    assert_eq!(delivered, 1);
    let received = drain(&mut rx);
    assert_eq!(received[0].event, "announcement:new");
    assert!(drain(&mut other_rx).is_empty());

    handle_text_frame(
        service.manager(),
        id,
        &identity,
        r#"{"type":"unsubscribe","payload":"course:42"}"#,
    );
    drain(&mut rx);
    assert_eq!(
        service
            .manager()
            .broadcast_to_channel("course:42", "announcement:new", json!({}), false),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_terminates_silent_connection() {
    let service = service();
    let (live, _, mut live_rx) = connect(&service, "u1");
    let (silent, _, mut silent_rx) = connect(&service, "u2");
    service.start();

    // answer every ping on the live connection
    let registry = service.registry().clone();
    let responder = tokio::spawn(async move {
        while let Some(frame) = live_rx.recv().await {
            if frame == Frame::Ping {
                registry.mark_alive(live);
            }
        }
    });

    sleep(Duration::from_secs(31)).await;
    assert_eq!(silent_rx.try_recv().unwrap(), Frame::Ping);
    assert!(service.registry().contains(silent));

    sleep(Duration::from_secs(30)).await;
    assert_eq!(
        silent_rx.try_recv().unwrap(),
        Frame::Close {
            code: 1001,
            reason: "Heartbeat timeout".into()
        }
    );
    assert!(!service.registry().contains(silent));

    sleep(Duration::from_secs(300)).await;
    assert!(service.registry().contains(live));

    service.shutdown();
    responder.abort();
}
