use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;

/// Unique identifier for a notification record.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of notification IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(pub String);

impl NotificationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the user a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecipientId(pub String);

impl RecipientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecipientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecipientId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Delivery medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    Email,
    Sms,
    InApp,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Push, Channel::Email, Channel::Sms, Channel::InApp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::InApp => "in_app",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(Channel::Push),
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            "in_app" | "in-app" | "inapp" => Ok(Channel::InApp),
            other => Err(DispatchError::validation(format!("unknown channel: {other:?}"))),
        }
    }
}

/// Delivery priority. Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(DispatchError::validation(format!("unknown priority: {other:?}"))),
        }
    }
}

/// Lifecycle status of a notification.
///
/// ```text
/// pending -> sent -> delivered
/// pending -> failed -> pending (retry re-arm)
/// pending -> expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Expired,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Expired => "expired",
        }
    }

    pub fn can_transition_to(self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Pending, Expired)
                | (Sent, Delivered)
                | (Sent, Failed)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(NotificationStatus::Pending),
            "sent" => Ok(NotificationStatus::Sent),
            "delivered" => Ok(NotificationStatus::Delivered),
            "failed" => Ok(NotificationStatus::Failed),
            "expired" => Ok(NotificationStatus::Expired),
            other => Err(DispatchError::validation(format!("unknown status: {other:?}"))),
        }
    }
}

/// The unit of delivery: one recipient, one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient_id: RecipientId,
    pub notification_type: String,
    pub title: String,
    pub body: String,
    pub channel: Channel,
    pub priority: Priority,
    pub status: NotificationStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Optimistic concurrency token, bumped by the store on every update.
    #[serde(default)]
    pub version: u64,
}

impl Notification {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.map_or(true, |at| at <= now)
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    fn transition(&mut self, next: NotificationStatus, now: DateTime<Utc>) -> Result<(), DispatchError> {
        if !self.status.can_transition_to(next) {
            return Err(DispatchError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Provider accepted the notification.
    pub fn mark_sent(&mut self, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.transition(NotificationStatus::Sent, now)?;
        self.sent_at = Some(now);
        self.last_error = None;
        Ok(())
    }

    pub fn mark_delivered(&mut self, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.transition(NotificationStatus::Delivered, now)
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.transition(NotificationStatus::Failed, now)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.transition(NotificationStatus::Expired, now)
    }

    /// Move a failed notification back to pending for another attempt.
    pub fn rearm(&mut self, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.transition(NotificationStatus::Pending, now)?;
        self.retry_count += 1;
        Ok(())
    }
}

/// Reference to a stored template plus the values for its placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub name: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl TemplateRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variables: HashMap::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

/// A request to notify a single recipient.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendRequest {
    pub recipient_id: String,
    pub notification_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub template: Option<TemplateRef>,
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl SendRequest {
    /// Create a request with inline content and default priority.
    pub fn new(
        recipient_id: impl Into<String>,
        notification_type: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            notification_type: notification_type.into(),
            title: title.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Create a request whose content comes from a stored template.
    pub fn from_template(
        recipient_id: impl Into<String>,
        notification_type: impl Into<String>,
        template: TemplateRef,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            notification_type: notification_type.into(),
            template: Some(template),
            ..Default::default()
        }
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = Channel>) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// The same notification addressed to many recipients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkSendRequest {
    pub recipient_ids: Vec<String>,
    pub notification_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub template: Option<TemplateRef>,
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl BulkSendRequest {
    /// Expand into one single-recipient request per recipient.
    pub fn per_recipient(&self) -> impl Iterator<Item = SendRequest> + '_ {
        self.recipient_ids.iter().map(move |recipient| SendRequest {
            recipient_id: recipient.clone(),
            notification_type: self.notification_type.clone(),
            title: self.title.clone(),
            body: self.body.clone(),
            template: self.template.clone(),
            channels: self.channels.clone(),
            priority: self.priority,
            scheduled_at: self.scheduled_at,
            expires_at: self.expires_at,
            data: self.data.clone(),
        })
    }
}
