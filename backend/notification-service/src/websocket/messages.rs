/// WebSocket wire format
///
/// Server → client frames share one envelope:
/// `{"event", "data", "messageId", "timestamp", "requireAck"}` with `retryCount`
/// added on resends. Client → server frames are small tagged control messages.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::{Identity, Role};

/// Server-initiated event names
pub mod events {
    pub const CONNECTED: &str = "connected";
    pub const SUBSCRIBED: &str = "subscribed";
    pub const UNSUBSCRIBED: &str = "unsubscribed";
    pub const PONG: &str = "pong";
    pub const NOTIFICATION: &str = "notification";
    pub const ANNOUNCEMENT_NEW: &str = "announcement:new";
    pub const ANNOUNCEMENT_UPDATED: &str = "announcement:updated";
    pub const RESULT_PUBLISHED: &str = "result:published";
    pub const EXAM_AUTO_SUBMITTED: &str = "exam:auto-submitted";
    pub const EXAM_TIMER_WARNING: &str = "exam:timer-warning";
    pub const ERROR: &str = "error";
}

/// Well-known channels
pub mod channels {
    pub const ANNOUNCEMENTS: &str = "announcements";

    pub fn course(course_id: &str) -> String {
        format!("course:{}", course_id)
    }
}

/// Error codes carried by the `error` event
pub mod error_codes {
    pub const INVALID_FRAME: &str = "INVALID_FRAME";
    pub const INVALID_CHANNEL: &str = "INVALID_CHANNEL";
    pub const FORBIDDEN_CHANNEL: &str = "FORBIDDEN_CHANNEL";
    pub const UNSUPPORTED_FRAME: &str = "UNSUPPORTED_FRAME";
}

const MAX_CHANNEL_LEN: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerEnvelope {
    pub event: String,
    pub data: Value,
    pub message_id: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub require_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl ServerEnvelope {
    pub fn new(event: impl Into<String>, data: Value, require_ack: bool) -> Self {
        Self {
            event: event.into(),
            data,
            message_id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            require_ack,
            retry_count: None,
        }
    }

    /// Same event, payload and message id; fresh timestamp
    pub fn resend(
        event: &str,
        data: &Value,
        message_id: &str,
        retry_count: u32,
    ) -> Self {
        Self {
            event: event.to_string(),
            data: data.clone(),
            message_id: message_id.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            require_ack: true,
            retry_count: Some(retry_count),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Control frames sent by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Subscribe {
        payload: String,
    },
    Unsubscribe {
        payload: String,
    },
    Ack {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Ping,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Normalized channel name, or `None` when it is empty or oversized
pub fn normalize_channel(channel: &str) -> Option<&str> {
    let channel = channel.trim();
    if channel.is_empty() || channel.len() > MAX_CHANNEL_LEN {
        None
    } else {
        Some(channel)
    }
}

/// `user:<id>` channels are private to that user (admins may watch any)
pub fn can_subscribe(identity: &Identity, channel: &str) -> bool {
    match channel.strip_prefix("user:") {
        Some(owner) => owner == identity.user_id || identity.role == Role::Admin,
        None => true,
    }
}
