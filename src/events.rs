//! Lifecycle events emitted to an external sink.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::error::EventError;
use crate::types::{Channel, Notification, NotificationId, RecipientId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Sent,
    Delivered,
    Failed,
    Read,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub notification_id: NotificationId,
    pub recipient_id: RecipientId,
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    /// Set for `Failed` events.
    pub error: Option<String>,
}

impl NotificationEvent {
    pub fn for_notification(kind: EventKind, notification: &Notification, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            notification_id: notification.id.clone(),
            recipient_id: notification.recipient_id.clone(),
            channel: notification.channel,
            timestamp,
            error: match kind {
                EventKind::Failed => notification.last_error.clone(),
                _ => None,
            },
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &NotificationEvent) -> Result<(), EventError>;
}

/// Publishes events without letting sink failures leak into delivery.
#[derive(Clone)]
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub async fn publish(&self, kind: EventKind, notification: &Notification, at: DateTime<Utc>) {
        let event = NotificationEvent::for_notification(kind, notification, at);
        if let Err(err) = self.sink.publish(&event).await {
            warn!(
                notification_id = %notification.id,
                kind = ?kind,
                error = %err,
                "failed to publish notification event"
            );
        }
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish(&self, _event: &NotificationEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Keeps every published event in memory.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<NotificationEvent> {
        self.events.lock().await.clone()
    }

    pub async fn of_kind(&self, kind: EventKind) -> Vec<NotificationEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, event: &NotificationEvent) -> Result<(), EventError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Fans events out to in-process subscribers, e.g. in-app socket sessions.
///
/// Publishing with no live subscriber is not an error; slow subscribers
/// lose the oldest events.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<NotificationEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn publish(&self, event: &NotificationEvent) -> Result<(), EventError> {
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NotificationStatus, Priority};
    use std::collections::HashMap;

    struct Closed;

    #[async_trait]
    impl EventSink for Closed {
        async fn publish(&self, _event: &NotificationEvent) -> Result<(), EventError> {
            Err(EventError::Closed)
        }
    }

    fn failed() -> Notification {
        let now = Utc::now();
        Notification {
            id: NotificationId("n1".into()),
            recipient_id: RecipientId::new("u1"),
            notification_type: "t".into(),
            title: "a".into(),
            body: "b".into(),
            channel: Channel::Sms,
            priority: Priority::High,
            status: NotificationStatus::Failed,
            scheduled_at: None,
            expires_at: None,
            retry_count: 0,
            last_error: Some("carrier down".into()),
            sent_at: None,
            read_at: None,
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn failed_events_carry_the_error() {
        let sink = Arc::new(MemoryEventSink::new());
        let publisher = EventPublisher::new(sink.clone());
        publisher.publish(EventKind::Failed, &failed(), Utc::now()).await;
        publisher.publish(EventKind::Read, &failed(), Utc::now()).await;

        let events = sink.snapshot().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].error.as_deref(), Some("carrier down"));
        assert_eq!(events[0].channel, Channel::Sms);
        assert_eq!(events[1].error, None);
    }

    #[tokio::test]
    async fn sink_errors_are_swallowed() {
        let publisher = EventPublisher::new(Arc::new(Closed));
        publisher.publish(EventKind::Sent, &failed(), Utc::now()).await;
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();
        let event = NotificationEvent::for_notification(EventKind::Delivered, &failed(), Utc::now());
        sink.publish(&event).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
