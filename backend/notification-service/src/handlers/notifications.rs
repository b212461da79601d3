/// Notification inbox handlers
///
/// Read side of the persistence bridge for the authenticated caller.
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, Result};
use crate::models::NotificationPage;
use crate::services::{normalize_paging, Notifier};

/// API Response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub unread_only: bool,
}

/// List the caller's notifications, newest first
///
/// GET /api/v1/notifications?page=&limit=&unreadOnly=
pub async fn list_notifications(
    user: AuthenticatedUser,
    notifier: web::Data<Notifier>,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse> {
    let (page, limit) = normalize_paging(query.page, query.limit);
    let (notifications, total) = notifier
        .store()
        .list_for_user(&user.0.user_id, page, limit, query.unread_only)
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::ok(NotificationPage {
        notifications,
        total,
        page,
        limit,
    })))
}

/// GET /api/v1/notifications/unread-count
pub async fn unread_count(
    user: AuthenticatedUser,
    notifier: web::Data<Notifier>,
) -> Result<HttpResponse> {
    let count = notifier.store().count_unread(&user.0.user_id).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(serde_json::json!({ "count": count }))))
}

/// Mark notification as read
///
/// PUT /api/v1/notifications/{id}/read
pub async fn mark_as_read(
    user: AuthenticatedUser,
    notifier: web::Data<Notifier>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let notification_id = path.into_inner();

    match notifier
        .store()
        .mark_read(notification_id, &user.0.user_id)
        .await?
    {
        Some(notification) => Ok(HttpResponse::Ok().json(ApiResponse::ok(notification))),
        None => Err(AppError::NotFound("Notification not found".to_string())),
    }
}

/// PUT /api/v1/notifications/read-all
pub async fn mark_all_as_read(
    user: AuthenticatedUser,
    notifier: web::Data<Notifier>,
) -> Result<HttpResponse> {
    let updated = notifier.store().mark_all_read(&user.0.user_id).await?;
    tracing::debug!(user_id = %user.0.user_id, updated, "marked all notifications read");
    Ok(HttpResponse::Ok().json(ApiResponse::ok(serde_json::json!({ "updated": updated }))))
}

/// Register routes
pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/notifications")
            .route("", web::get().to(list_notifications))
            .route("/unread-count", web::get().to(unread_count))
            .route("/read-all", web::put().to(mark_all_as_read))
            .route("/{id}/read", web::put().to(mark_as_read)),
    );
}
