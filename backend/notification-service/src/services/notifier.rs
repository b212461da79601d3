/// Domain event fan-out
///
/// Persist first, then push the live event. A failed store call aborts the
/// push; a push that reaches nobody still leaves the record stored for the
/// next poll.
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::notification_store::NotificationStore;
use crate::error::Result;
use crate::models::{NewNotification, NotificationRecord, NotificationType};
use crate::websocket::{channels, events, ConnectionManager, DeliveryPolicy, RealtimeService};

/// What a persist-then-push call did
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyOutcome {
    pub notification: NotificationRecord,
    /// Connections the live event was queued on
    pub delivered: usize,
}

#[derive(Clone)]
pub struct Notifier {
    manager: ConnectionManager,
    store: Arc<dyn NotificationStore>,
    policy: DeliveryPolicy,
}

impl Notifier {
    pub fn new(service: &RealtimeService, store: Arc<dyn NotificationStore>) -> Self {
        Self {
            manager: service.manager().clone(),
            store,
            policy: service.delivery_policy().clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    pub async fn notify_user(
        &self,
        user_id: &str,
        notification_type: NotificationType,
        title: &str,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<NotifyOutcome> {
        let record = self
            .store
            .create_notification(NewNotification::new(
                user_id,
                notification_type,
                title,
                message,
                metadata,
            ))
            .await?;

        let delivered = self.push_to_user(user_id, events::NOTIFICATION, serde_json::to_value(&record)?);
        Ok(NotifyOutcome {
            notification: record,
            delivered,
        })
    }

    /// Push to the `announcements` channel and, when given, the course channel.
    /// A connection on both receives it once.
    pub fn announcement_created(&self, course_id: Option<&str>, announcement: Value) -> usize {
        self.push_announcement(events::ANNOUNCEMENT_NEW, course_id, announcement)
    }

    pub fn announcement_updated(&self, course_id: Option<&str>, announcement: Value) -> usize {
        self.push_announcement(events::ANNOUNCEMENT_UPDATED, course_id, announcement)
    }

    pub async fn result_published(&self, student_id: &str, result: Value) -> Result<NotifyOutcome> {
        let message = match result.get("examTitle").and_then(Value::as_str) {
            Some(exam) => format!("Your result for {} is now available", exam),
            None => "A new exam result is now available".to_string(),
        };

        let record = self
            .store
            .create_notification(NewNotification::new(
                student_id,
                NotificationType::Result,
                "Result published",
                message,
                Some(result.clone()),
            ))
            .await?;

        let delivered = self.push_to_user(
            student_id,
            events::RESULT_PUBLISHED,
            json!({ "notificationId": record.id, "result": result }),
        );
        Ok(NotifyOutcome {
            notification: record,
            delivered,
        })
    }

    pub async fn exam_auto_submitted(&self, student_id: &str, exam: Value) -> Result<NotifyOutcome> {
        let message = match exam.get("title").and_then(Value::as_str) {
            Some(title) => format!("Time ran out and {} was submitted automatically", title),
            None => "Time ran out and your exam was submitted automatically".to_string(),
        };

        let record = self
            .store
            .create_notification(NewNotification::new(
                student_id,
                NotificationType::Exam,
                "Exam auto-submitted",
                message,
                Some(exam.clone()),
            ))
            .await?;

        let delivered = self.push_to_user(
            student_id,
            events::EXAM_AUTO_SUBMITTED,
            json!({ "notificationId": record.id, "exam": exam }),
        );
        Ok(NotifyOutcome {
            notification: record,
            delivered,
        })
    }

    /// Ephemeral, never stored
    pub fn exam_timer_warning(&self, student_id: &str, exam_id: &str, minutes_left: u32) -> usize {
        self.push_to_user(
            student_id,
            events::EXAM_TIMER_WARNING,
            json!({ "examId": exam_id, "minutesLeft": minutes_left }),
        )
    }

    fn push_to_user(&self, user_id: &str, event: &str, data: Value) -> usize {
        let delivered = self
            .manager
            .send_to_user(user_id, event, data, self.policy.requires_ack(event));
        if delivered == 0 {
            tracing::debug!(user_id, event, "recipient offline, stored only");
        }
        delivered
    }

    fn push_announcement(&self, event: &str, course_id: Option<&str>, announcement: Value) -> usize {
        let mut targets = vec![channels::ANNOUNCEMENTS.to_string()];
        if let Some(course_id) = course_id {
            targets.push(channels::course(course_id));
        }

        let delivered = self.manager.broadcast_to_channels(
            &targets,
            event,
            announcement,
            self.policy.requires_ack(event),
        );
        tracing::info!(event, ?course_id, delivered, "announcement pushed");
        delivered
    }
}
