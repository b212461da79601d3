/// HTTP handlers for the realtime notification service
pub mod notifications;
pub mod websocket;

use actix_web::web;

pub use notifications::ApiResponse;

/// Mount `/ws`, `/api/v1/ws/*` and `/api/v1/notifications/*`
pub fn configure(cfg: &mut web::ServiceConfig) {
    websocket::register_routes(cfg);
    notifications::register_routes(cfg);
}
