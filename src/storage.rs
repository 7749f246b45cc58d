use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{Notification, NotificationId, NotificationStatus, RecipientId};

/// Persistent store for notification records.
///
/// `update` is an optimistic write: it succeeds only when the stored
/// record still carries `notification.version`, and returns the record
/// with its version bumped.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create(&self, notification: &Notification) -> Result<(), StoreError>;
    async fn update(&self, notification: &Notification) -> Result<Notification, StoreError>;
    async fn get_by_id(&self, id: &NotificationId) -> Result<Option<Notification>, StoreError>;
    /// Newest first.
    async fn get_by_user_id(
        &self,
        recipient: &RecipientId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Notification>, StoreError>;
    /// Ordered by due time: `scheduled_at`, or `created_at` when unscheduled.
    async fn get_pending(&self, limit: usize) -> Result<Vec<Notification>, StoreError>;
    /// Failed records with fewer than `max_retries` attempts behind them,
    /// least recently updated first.
    async fn get_failed(&self, max_retries: u32, limit: usize) -> Result<Vec<Notification>, StoreError>;
    /// Delete every record created before `cutoff`, returning how many were removed.
    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// In-memory store for lightweight deployments.
#[derive(Default)]
pub struct InMemoryNotificationStore {
    records: RwLock<HashMap<NotificationId, Notification>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn with_status_by<P, K, F>(&self, status: NotificationStatus, limit: usize, keep: P, key: F) -> Vec<Notification>
    where
        P: Fn(&Notification) -> bool,
        K: Ord,
        F: Fn(&Notification) -> K,
    {
        let guard = self.records.read().await;
        let mut matching: Vec<Notification> = guard
            .values()
            .filter(|n| n.status == status && keep(n))
            .cloned()
            .collect();
        matching.sort_by(|a, b| key(a).cmp(&key(b)).then_with(|| a.id.cmp(&b.id)));
        matching.truncate(limit);
        matching
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn create(&self, notification: &Notification) -> Result<(), StoreError> {
        let mut guard = self.records.write().await;
        if guard.contains_key(&notification.id) {
            return Err(StoreError::AlreadyExists(notification.id.clone()));
        }
        guard.insert(notification.id.clone(), notification.clone());
        Ok(())
    }

    async fn update(&self, notification: &Notification) -> Result<Notification, StoreError> {
        let mut guard = self.records.write().await;
        let stored = guard
            .get_mut(&notification.id)
            .ok_or_else(|| StoreError::NotFound(notification.id.clone()))?;

        if stored.version != notification.version {
            return Err(StoreError::Conflict {
                id: notification.id.clone(),
                expected: notification.version,
                found: stored.version,
            });
        }

        let mut next = notification.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn get_by_id(&self, id: &NotificationId) -> Result<Option<Notification>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn get_by_user_id(
        &self,
        recipient: &RecipientId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let guard = self.records.read().await;
        let mut matching: Vec<Notification> = guard
            .values()
            .filter(|n| &n.recipient_id == recipient)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<Notification>, StoreError> {
        Ok(self
            .with_status_by(NotificationStatus::Pending, limit, |_| true, |n| {
                n.scheduled_at.unwrap_or(n.created_at)
            })
            .await)
    }

    async fn get_failed(&self, max_retries: u32, limit: usize) -> Result<Vec<Notification>, StoreError> {
        Ok(self
            .with_status_by(
                NotificationStatus::Failed,
                limit,
                |n| n.retry_count < max_retries,
                |n| n.updated_at,
            )
            .await)
    }

    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut guard = self.records.write().await;
        let before = guard.len();
        guard.retain(|_, n| n.created_at >= cutoff);
        Ok((before - guard.len()) as u64)
    }
}
