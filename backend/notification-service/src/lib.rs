pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod websocket;

pub use config::Config;
pub use error::{AppError, Result};
pub use services::{InMemoryNotificationStore, NotificationStore, Notifier};
pub use websocket::{ConnectionManager, ConnectionRegistry, RealtimeService};
