/// Session actor over a real socket
///
/// Runs the HTTP server on an ephemeral port and talks to `/ws` with an awc
/// client, so frames go through `WsSession` exactly as in production.
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::web::{self, Bytes};
use actix_web::{App, HttpServer};
use awc::ws;
use futures::{SinkExt, Stream, StreamExt};
use realtime_notification_service::auth::{Identity, JwtVerifier, Role};
use realtime_notification_service::websocket::heartbeat::sweep;
use realtime_notification_service::websocket::{DeliveryPolicy, RetryPolicy, ServerEnvelope};
use realtime_notification_service::{handlers, InMemoryNotificationStore, Notifier, RealtimeService};
use serde_json::json;

const SECRET: &str = "session-test-secret-0123456789";

fn state() -> (web::Data<RealtimeService>, web::Data<Notifier>) {
    let service = web::Data::new(RealtimeService::new(
        Arc::new(JwtVerifier::new(SECRET)),
        RetryPolicy::default(),
        DeliveryPolicy::default(),
        Duration::from_secs(30),
    ));
    let notifier = web::Data::new(Notifier::new(
        &service,
        Arc::new(InMemoryNotificationStore::new()),
    ));
    (service, notifier)
}

async fn start_server(
    service: web::Data<RealtimeService>,
    notifier: web::Data<Notifier>,
) -> std::io::Result<(SocketAddr, ServerHandle)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(service.clone())
            .app_data(notifier.clone())
            .configure(handlers::configure)
    })
    .workers(1)
    .disable_signals()
    .listen(listener)?
    .run();

    let handle = server.handle();
    actix_web::rt::spawn(server);
    Ok((addr, handle))
}

fn ws_url(addr: SocketAddr, user_id: &str) -> String {
    let token = JwtVerifier::new(SECRET)
        .issue_token(&Identity::new(user_id, "", Role::Student), chrono::Duration::hours(1))
        .unwrap();
    format!("ws://{addr}/ws?token={token}")
}

async fn next_frame<S, E>(conn: &mut S) -> ws::Frame
where
    S: Stream<Item = Result<ws::Frame, E>> + Unpin,
    E: std::fmt::Debug,
{
    tokio::time::timeout(Duration::from_secs(5), conn.next())
        .await
        .expect("frame within timeout")
        .expect("socket open")
        .expect("valid frame")
}

fn envelope(frame: ws::Frame) -> ServerEnvelope {
    match frame {
        ws::Frame::Text(bytes) => {
            ServerEnvelope::from_json(std::str::from_utf8(&bytes).unwrap()).unwrap()
        }
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[actix_web::test]
async fn test_pong_keeps_connection_alive() {
    let (service, notifier) = state();
    let (addr, handle) = start_server(service.clone(), notifier).await.unwrap();
    let (_resp, mut conn) = awc::Client::new()
        .ws(ws_url(addr, "s1"))
        .connect()
        .await
        .expect("connect websocket client");

    assert_eq!(envelope(next_frame(&mut conn).await).event, "connected");
    let id = service.registry().connection_ids_for_user("s1")[0];

    assert_eq!(sweep(service.registry()).pinged, 1);
    assert!(matches!(next_frame(&mut conn).await, ws::Frame::Ping(_)));
    conn.send(ws::Message::Pong(Bytes::new())).await.unwrap();

    // frames are handled in order, so the pong was seen once this reply arrives
    conn.send(ws::Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    assert_eq!(envelope(next_frame(&mut conn).await).event, "pong");

    let report = sweep(service.registry());
    assert_eq!(report.terminated, 0);
    assert!(service.registry().contains(id));
    assert!(matches!(next_frame(&mut conn).await, ws::Frame::Ping(_)));

    handle.stop(false).await;
}

#[actix_web::test]
async fn test_silent_connection_receives_heartbeat_close() {
    let (service, notifier) = state();
    let (addr, handle) = start_server(service.clone(), notifier).await.unwrap();
    let (_resp, mut conn) = awc::Client::new()
        .ws(ws_url(addr, "s1"))
        .connect()
        .await
        .expect("connect websocket client");
    next_frame(&mut conn).await;

    sweep(service.registry());
    assert!(matches!(next_frame(&mut conn).await, ws::Frame::Ping(_)));

    assert_eq!(sweep(service.registry()).terminated, 1);
    match next_frame(&mut conn).await {
        ws::Frame::Close(Some(reason)) => {
            assert_eq!(u16::from(reason.code), 1001);
            assert_eq!(reason.description.as_deref(), Some("Heartbeat timeout"));
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    assert_eq!(service.registry().total_connections(), 0);

    handle.stop(false).await;
}

#[actix_web::test]
async fn test_ack_over_socket_resolves_pending() {
    let (service, notifier) = state();
    let (addr, handle) = start_server(service.clone(), notifier).await.unwrap();
    let (_resp, mut conn) = awc::Client::new()
        .ws(ws_url(addr, "s1"))
        .connect()
        .await
        .expect("connect websocket client");
    next_frame(&mut conn).await;
    let id = service.registry().connection_ids_for_user("s1")[0];

    service
        .manager()
        .send_to_user("s1", "notification", json!({"title": "Grade posted"}), true);
    let pushed = envelope(next_frame(&mut conn).await);
    assert!(pushed.require_ack);
    assert_eq!(service.registry().pending_count(id), 1);

    let ack = format!(r#"{{"type":"ack","messageId":"{}"}}"#, pushed.message_id);
    conn.send(ws::Message::Text(ack.into())).await.unwrap();

    let registry = service.registry().clone();
    wait_until(move || registry.pending_count(id) == 0).await;

    handle.stop(false).await;
}

#[actix_web::test]
async fn test_client_close_removes_connection() {
    let (service, notifier) = state();
    let (addr, handle) = start_server(service.clone(), notifier).await.unwrap();
    let (_resp, mut conn) = awc::Client::new()
        .ws(ws_url(addr, "s1"))
        .connect()
        .await
        .expect("connect websocket client");
    next_frame(&mut conn).await;
    assert_eq!(service.registry().connection_count("s1"), 1);

    conn.send(ws::Message::Close(Some(ws::CloseCode::Normal.into())))
        .await
        .unwrap();

    let registry = service.registry().clone();
    wait_until(move || registry.connection_count("s1") == 0).await;

    handle.stop(false).await;
}
