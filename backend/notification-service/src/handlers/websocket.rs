/// WebSocket handlers
///
/// `GET /ws?token=<jwt>` upgrades and admits a socket. The `/api/v1/ws` scope
/// exposes connection stats and lets staff push to users and channels.
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use serde_json::{json, Value};

use super::notifications::ApiResponse;
use crate::auth::{bearer_token, AuthenticatedUser};
use crate::error::{AppError, Result};
use crate::models::NotificationType;
use crate::services::Notifier;
use crate::websocket::messages::normalize_channel;
use crate::websocket::{RealtimeService, RejectedSession, WsSession};

/// WebSocket message size limit (256 KB)
const WS_MESSAGE_SIZE_LIMIT: usize = 256_000;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// Endpoint: GET /ws?token=<jwt>
///
/// A bad or missing token still completes the upgrade so the client sees the
/// 4001/4002/4003 close code instead of a bare HTTP error.
pub async fn ws_connect(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<WsParams>,
    service: web::Data<RealtimeService>,
) -> std::result::Result<HttpResponse, actix_web::Error> {
    // refuse plain HTTP before anything is registered
    ws::handshake(&req)?;

    let token = query.into_inner().token.or_else(|| bearer_token(&req));
    let identity = match service.authenticate(token.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(
                reason = e.kind(),
                close_code = e.close_code(),
                peer = ?req.peer_addr(),
                "websocket connection rejected"
            );
            return ws::start(RejectedSession::new(e), &req, stream);
        }
    };

    let (id, outbound) = service.connect(identity.clone());
    let session = WsSession::new(id, identity, service.clone(), outbound);

    ws::WsResponseBuilder::new(session, &req, stream)
        .frame_size(WS_MESSAGE_SIZE_LIMIT)
        .start()
        .map_err(|e| {
            service.disconnect(id);
            e
        })
}

/// Endpoint: GET /api/v1/ws/stats
pub async fn ws_stats(
    user: AuthenticatedUser,
    service: web::Data<RealtimeService>,
) -> Result<HttpResponse> {
    user.require_admin()?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(service.registry().stats())))
}

/// Endpoint: GET /api/v1/ws/status/{user_id}
pub async fn ws_status(
    user: AuthenticatedUser,
    path: web::Path<String>,
    service: web::Data<RealtimeService>,
) -> Result<HttpResponse> {
    let user_id = path.into_inner();
    if user.0.user_id != user_id {
        user.require_admin()?;
    }

    let connection_count = service.registry().connection_count(&user_id);
    Ok(HttpResponse::Ok().json(ApiResponse::ok(json!({
        "userId": user_id,
        "connected": connection_count > 0,
        "connectionCount": connection_count
    }))))
}

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    #[serde(rename = "type")]
    pub notification_type: Option<String>,
    pub title: String,
    pub message: String,
    pub metadata: Option<Value>,
}

/// Persist a notification for the user, then push it live
///
/// Endpoint: POST /api/v1/ws/notify/{user_id}
pub async fn send_user_notification(
    user: AuthenticatedUser,
    path: web::Path<String>,
    notifier: web::Data<Notifier>,
    body: web::Json<NotifyRequest>,
) -> Result<HttpResponse> {
    user.require_publisher()?;
    let recipient_id = path.into_inner();
    let body = body.into_inner();

    if body.title.trim().is_empty() {
        return Err(AppError::BadRequest("title is required".to_string()));
    }
    let notification_type = match body.notification_type.as_deref() {
        Some(t) => t.parse()?,
        None => NotificationType::System,
    };

    let outcome = notifier
        .notify_user(
            &recipient_id,
            notification_type,
            &body.title,
            &body.message,
            body.metadata,
        )
        .await?;

    tracing::info!(
        sender = %user.0.user_id,
        recipient_id = %recipient_id,
        delivered = outcome.delivered,
        "notification sent"
    );
    Ok(HttpResponse::Ok().json(ApiResponse::ok(outcome)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub require_ack: bool,
}

/// Endpoint: POST /api/v1/ws/channels/{channel}/broadcast
pub async fn broadcast_to_channel(
    user: AuthenticatedUser,
    path: web::Path<String>,
    service: web::Data<RealtimeService>,
    body: web::Json<BroadcastRequest>,
) -> Result<HttpResponse> {
    user.require_publisher()?;
    let raw_channel = path.into_inner();
    let channel = normalize_channel(&raw_channel)
        .ok_or_else(|| AppError::BadRequest("invalid channel".to_string()))?;
    let body = body.into_inner();
    if body.event.trim().is_empty() {
        return Err(AppError::BadRequest("event is required".to_string()));
    }

    let delivered =
        service
            .manager()
            .broadcast_to_channel(channel, &body.event, body.data, body.require_ack);

    tracing::info!(
        sender = %user.0.user_id,
        channel,
        event = %body.event,
        delivered,
        "channel broadcast"
    );
    Ok(HttpResponse::Ok().json(ApiResponse::ok(json!({
        "channel": channel,
        "delivered": delivered
    }))))
}

/// System-wide notice to every open connection
///
/// Endpoint: POST /api/v1/ws/broadcast
pub async fn broadcast_to_all(
    user: AuthenticatedUser,
    service: web::Data<RealtimeService>,
    body: web::Json<BroadcastRequest>,
) -> Result<HttpResponse> {
    user.require_admin()?;
    let body = body.into_inner();
    if body.event.trim().is_empty() {
        return Err(AppError::BadRequest("event is required".to_string()));
    }

    let delivered = service
        .manager()
        .broadcast(&body.event, body.data, body.require_ack);

    tracing::info!(
        sender = %user.0.user_id,
        event = %body.event,
        delivered,
        "system broadcast"
    );
    Ok(HttpResponse::Ok().json(ApiResponse::ok(json!({ "delivered": delivered }))))
}

/// Register WebSocket routes
pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws", web::get().to(ws_connect)).service(
        web::scope("/api/v1/ws")
            .route("/stats", web::get().to(ws_stats))
            .route("/status/{user_id}", web::get().to(ws_status))
            .route("/notify/{user_id}", web::post().to(send_user_notification))
            .route("/broadcast", web::post().to(broadcast_to_all))
            .route(
                "/channels/{channel}/broadcast",
                web::post().to(broadcast_to_channel),
            ),
    );
}
