#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use chrono::{DateTime, Utc};
#[cfg(feature = "postgres")]
use tokio_postgres::{Client, Row};

#[cfg(feature = "postgres")]
use crate::error::StoreError;
#[cfg(feature = "postgres")]
use crate::storage::NotificationStore;
#[cfg(feature = "postgres")]
use crate::types::{Notification, NotificationId, NotificationStatus, RecipientId};

/// Postgres-backed notification store.
///
/// Records are kept as JSONB with the columns the queries filter on
/// lifted out next to them.
#[cfg(feature = "postgres")]
pub struct PostgresNotificationStore {
    client: Client,
}

#[cfg(feature = "postgres")]
impl PostgresNotificationStore {
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS notifications (
                    id TEXT PRIMARY KEY,
                    recipient_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    version BIGINT NOT NULL,
                    due_at TIMESTAMPTZ NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    payload JSONB NOT NULL
                );
                ALTER TABLE notifications
                    ADD COLUMN IF NOT EXISTS retry_count INTEGER NOT NULL DEFAULT 0,
                    ADD COLUMN IF NOT EXISTS updated_at TIMESTAMPTZ NOT NULL DEFAULT now();
                CREATE INDEX IF NOT EXISTS notifications_recipient_idx
                    ON notifications (recipient_id, created_at DESC);
                CREATE INDEX IF NOT EXISTS notifications_status_idx
                    ON notifications (status, due_at);
                CREATE INDEX IF NOT EXISTS notifications_retry_idx
                    ON notifications (status, retry_count, updated_at);",
            )
            .await
            .map_err(StoreError::backend)?;

        Ok(Self { client })
    }

    fn decode(row: &Row) -> Result<Notification, StoreError> {
        let payload: serde_json::Value = row.try_get("payload").map_err(StoreError::backend)?;
        let version: i64 = row.try_get("version").map_err(StoreError::backend)?;
        let mut notification: Notification =
            serde_json::from_value(payload).map_err(StoreError::backend)?;
        notification.version = version as u64;
        Ok(notification)
    }

    fn decode_all(rows: Vec<Row>) -> Result<Vec<Notification>, StoreError> {
        rows.iter().map(Self::decode).collect()
    }

    async fn by_status(&self, status: NotificationStatus, order: &str, limit: usize) -> Result<Vec<Notification>, StoreError> {
        let query = format!(
            "SELECT version, payload FROM notifications
             WHERE status = $1
             ORDER BY {order} ASC, id ASC
             LIMIT $2"
        );
        let rows = self
            .client
            .query(query.as_str(), &[&status.as_str(), &(limit as i64)])
            .await
            .map_err(StoreError::backend)?;
        Self::decode_all(rows)
    }

    fn retry_count(notification: &Notification) -> i32 {
        i32::try_from(notification.retry_count).unwrap_or(i32::MAX)
    }
}

#[cfg(feature = "postgres")]
fn due_at(notification: &Notification) -> DateTime<Utc> {
    notification.scheduled_at.unwrap_or(notification.created_at)
}

#[cfg(feature = "postgres")]
#[async_trait]
impl NotificationStore for PostgresNotificationStore {
    async fn create(&self, notification: &Notification) -> Result<(), StoreError> {
        let payload = serde_json::to_value(notification).map_err(StoreError::backend)?;
        let inserted = self
            .client
            .execute(
                "INSERT INTO notifications
                     (id, recipient_id, status, version, due_at, created_at, payload, retry_count, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &notification.id.as_str(),
                    &notification.recipient_id.as_str(),
                    &notification.status.as_str(),
                    &(notification.version as i64),
                    &due_at(notification),
                    &notification.created_at,
                    &payload,
                    &Self::retry_count(notification),
                    &notification.updated_at,
                ],
            )
            .await
            .map_err(StoreError::backend)?;

        if inserted == 0 {
            return Err(StoreError::AlreadyExists(notification.id.clone()));
        }
        Ok(())
    }

    async fn update(&self, notification: &Notification) -> Result<Notification, StoreError> {
        let mut next = notification.clone();
        next.version += 1;
        let payload = serde_json::to_value(&next).map_err(StoreError::backend)?;

        let updated = self
            .client
            .execute(
                "UPDATE notifications
                 SET status = $2, version = $3, due_at = $4, payload = $5, retry_count = $7, updated_at = $8
                 WHERE id = $1 AND version = $6",
                &[
                    &next.id.as_str(),
                    &next.status.as_str(),
                    &(next.version as i64),
                    &due_at(&next),
                    &payload,
                    &(notification.version as i64),
                    &Self::retry_count(&next),
                    &next.updated_at,
                ],
            )
            .await
            .map_err(StoreError::backend)?;

        if updated == 1 {
            return Ok(next);
        }

        let row = self
            .client
            .query_opt(
                "SELECT version FROM notifications WHERE id = $1",
                &[&notification.id.as_str()],
            )
            .await
            .map_err(StoreError::backend)?;

        match row {
            Some(row) => {
                let found: i64 = row.try_get(0).map_err(StoreError::backend)?;
                Err(StoreError::Conflict {
                    id: notification.id.clone(),
                    expected: notification.version,
                    found: found as u64,
                })
            }
            None => Err(StoreError::NotFound(notification.id.clone())),
        }
    }

    async fn get_by_id(&self, id: &NotificationId) -> Result<Option<Notification>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT version, payload FROM notifications WHERE id = $1",
                &[&id.as_str()],
            )
            .await
            .map_err(StoreError::backend)?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn get_by_user_id(
        &self,
        recipient: &RecipientId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT version, payload FROM notifications
                 WHERE recipient_id = $1
                 ORDER BY created_at DESC
                 LIMIT $2 OFFSET $3",
                &[&recipient.as_str(), &(limit as i64), &(offset as i64)],
            )
            .await
            .map_err(StoreError::backend)?;
        Self::decode_all(rows)
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<Notification>, StoreError> {
        self.by_status(NotificationStatus::Pending, "due_at", limit).await
    }

    async fn get_failed(&self, max_retries: u32, limit: usize) -> Result<Vec<Notification>, StoreError> {
        let max_retries = i32::try_from(max_retries).unwrap_or(i32::MAX);
        let rows = self
            .client
            .query(
                "SELECT version, payload FROM notifications
                 WHERE status = $1 AND retry_count < $2
                 ORDER BY updated_at ASC, id ASC
                 LIMIT $3",
                &[&NotificationStatus::Failed.as_str(), &max_retries, &(limit as i64)],
            )
            .await
            .map_err(StoreError::backend)?;
        Self::decode_all(rows)
    }

    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.client
            .execute("DELETE FROM notifications WHERE created_at < $1", &[&cutoff])
            .await
            .map_err(StoreError::backend)
    }
}
