use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

/// Notification type enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationType {
    /// Course or platform announcement
    Announcement,
    /// Exam result published
    Result,
    /// Exam lifecycle (auto-submission etc.)
    Exam,
    /// System notification
    System,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Announcement => "ANNOUNCEMENT",
            NotificationType::Result => "RESULT",
            NotificationType::Exam => "EXAM",
            NotificationType::System => "SYSTEM",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ANNOUNCEMENT" => Ok(NotificationType::Announcement),
            "RESULT" => Ok(NotificationType::Result),
            "EXAM" => Ok(NotificationType::Exam),
            "SYSTEM" => Ok(NotificationType::System),
            other => Err(AppError::BadRequest(format!(
                "unknown notification type: {}",
                other
            ))),
        }
    }
}

/// Stored notification, as returned by the persistence bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: Uuid,

    /// Recipient user ID
    pub user_id: String,

    #[serde(rename = "type")]
    pub notification_type: NotificationType,

    pub title: String,

    pub message: String,

    /// Free-form payload (course id, exam id, score, ...)
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,

    pub is_read: bool,

    pub read_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

/// Input to `NotificationStore::create_notification`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNotification {
    pub user_id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl NewNotification {
    pub fn new(
        user_id: impl Into<String>,
        notification_type: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            notification_type,
            title: title.into(),
            message: message.into(),
            metadata,
        }
    }
}

/// One page of a user's notifications
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
    pub notifications: Vec<NotificationRecord>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}
