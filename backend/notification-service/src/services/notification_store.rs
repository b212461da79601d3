/// Notification persistence bridge
///
/// The realtime layer never owns durable storage; route handlers persist
/// through this trait first and push afterwards.
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{NewNotification, NotificationRecord};

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Durable store for user notifications.
///
/// Implementations must be safe to share across handler threads.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create_notification(&self, notification: NewNotification) -> Result<NotificationRecord>;

    /// `None` when the id does not exist or belongs to another user
    async fn mark_read(&self, notification_id: Uuid, user_id: &str) -> Result<Option<NotificationRecord>>;

    /// Returns how many records changed
    async fn mark_all_read(&self, user_id: &str) -> Result<u64>;

    async fn count_unread(&self, user_id: &str) -> Result<u64>;

    /// Newest first. `page` is 1-based.
    async fn list_for_user(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
        unread_only: bool,
    ) -> Result<(Vec<NotificationRecord>, u64)>;
}

/// Clamp caller-supplied paging to sane bounds
pub fn normalize_paging(page: Option<u32>, limit: Option<u32>) -> (u32, u32) {
    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
    (page, limit)
}

/// Process-local store for development and tests
#[derive(Default)]
pub struct InMemoryNotificationStore {
    records: RwLock<HashMap<String, Vec<NotificationRecord>>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn create_notification(&self, notification: NewNotification) -> Result<NotificationRecord> {
        let record = NotificationRecord {
            id: Uuid::new_v4(),
            user_id: notification.user_id,
            notification_type: notification.notification_type,
            title: notification.title,
            message: notification.message,
            metadata: notification.metadata,
            is_read: false,
            read_at: None,
            created_at: Utc::now(),
        };

        self.records
            .write()
            .await
            .entry(record.user_id.clone())
            .or_default()
            .push(record.clone());

        tracing::debug!(
            notification_id = %record.id,
            user_id = %record.user_id,
            notification_type = %record.notification_type,
            "notification stored"
        );
        Ok(record)
    }

    async fn mark_read(&self, notification_id: Uuid, user_id: &str) -> Result<Option<NotificationRecord>> {
        let mut records = self.records.write().await;
        let Some(record) = records
            .get_mut(user_id)
            .and_then(|list| list.iter_mut().find(|r| r.id == notification_id))
        else {
            return Ok(None);
        };

        if !record.is_read {
            record.is_read = true;
            record.read_at = Some(Utc::now());
        }
        Ok(Some(record.clone()))
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        let mut records = self.records.write().await;
        let now = Utc::now();
        let mut updated = 0;
        for record in records.get_mut(user_id).into_iter().flatten() {
            if !record.is_read {
                record.is_read = true;
                record.read_at = Some(now);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn count_unread(&self, user_id: &str) -> Result<u64> {
        let records = self.records.read().await;
        Ok(records
            .get(user_id)
            .map(|list| list.iter().filter(|r| !r.is_read).count() as u64)
            .unwrap_or(0))
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        page: u32,
        limit: u32,
        unread_only: bool,
    ) -> Result<(Vec<NotificationRecord>, u64)> {
        let (page, limit) = normalize_paging(Some(page), Some(limit));
        let records = self.records.read().await;

        // stored in insertion order, so reverse for newest first
        let matching: Vec<&NotificationRecord> = records
            .get(user_id)
            .map(|list| {
                list.iter()
                    .rev()
                    .filter(|r| !unread_only || !r.is_read)
                    .collect()
            })
            .unwrap_or_default();

        let total = matching.len() as u64;
        let offset = ((page - 1) as usize).saturating_mul(limit as usize);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .cloned()
            .collect();

        Ok((items, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationType;

    fn new_notification(user_id: &str, title: &str) -> NewNotification {
        NewNotification::new(user_id, NotificationType::System, title, "body", None)
    }

    #[tokio::test]
    async fn test_create_and_count_unread() {
        let store = InMemoryNotificationStore::new();
        store.create_notification(new_notification("u1", "a")).await.unwrap();
        store.create_notification(new_notification("u1", "b")).await.unwrap();
        store.create_notification(new_notification("u2", "c")).await.unwrap();

        assert_eq!(store.count_unread("u1").await.unwrap(), 2);
        assert_eq!(store.count_unread("u2").await.unwrap(), 1);
        assert_eq!(store.count_unread("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_is_scoped_to_owner() {
        let store = InMemoryNotificationStore::new();
        let record = store.create_notification(new_notification("u1", "a")).await.unwrap();

        assert!(store.mark_read(record.id, "u2").await.unwrap().is_none());

        let read = store.mark_read(record.id, "u1").await.unwrap().unwrap();
        assert!(read.is_read);
        assert!(read.read_at.is_some());
        assert_eq!(store.count_unread("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_all_read_counts_changes() {
        let store = InMemoryNotificationStore::new();
        let first = store.create_notification(new_notification("u1", "a")).await.unwrap();
        store.create_notification(new_notification("u1", "b")).await.unwrap();
        store.mark_read(first.id, "u1").await.unwrap();

        assert_eq!(store.mark_all_read("u1").await.unwrap(), 1);
        assert_eq!(store.mark_all_read("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_pages_newest_first() {
        let store = InMemoryNotificationStore::new();
        for i in 0..5 {
            store
                .create_notification(new_notification("u1", &format!("n{}", i)))
                .await
                .unwrap();
        }

        let (page1, total) = store.list_for_user("u1", 1, 2, false).await.unwrap();
        assert_eq!(total, 5);
        let titles: Vec<&str> = page1.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["n4", "n3"]);

        let (page3, _) = store.list_for_user("u1", 3, 2, false).await.unwrap();
        assert_eq!(page3.len(), 1);
        assert_eq!(page3[0].title, "n0");

        let (beyond, _) = store.list_for_user("u1", 9, 2, false).await.unwrap();
        assert!(beyond.is_empty());
    }

    #[tokio::test]
    async fn test_list_unread_only() {
        let store = InMemoryNotificationStore::new();
        let read = store.create_notification(new_notification("u1", "read")).await.unwrap();
        store.create_notification(new_notification("u1", "unread")).await.unwrap();
        store.mark_read(read.id, "u1").await.unwrap();

        let (items, total) = store.list_for_user("u1", 1, 20, true).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(items[0].title, "unread");
    }

    #[test]
    fn test_normalize_paging() {
        assert_eq!(normalize_paging(None, None), (1, DEFAULT_PAGE_LIMIT));
        assert_eq!(normalize_paging(Some(0), Some(0)), (1, 1));
        assert_eq!(normalize_paging(Some(3), Some(500)), (3, MAX_PAGE_LIMIT));
    }
}
