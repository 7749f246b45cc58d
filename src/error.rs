use std::fmt;

use thiserror::Error;

use crate::types::{Channel, NotificationId, NotificationStatus, RecipientId};

/// Errors returned synchronously by the dispatcher.
///
/// Delivery failures are never returned from `send`; they are recorded
/// on the notification and surface through later reads of its status.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Missing or invalid request fields. No side effects were performed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The recipient exhausted its per-minute budget.
    #[error("rate limit exceeded for recipient {recipient}")]
    RateLimitExceeded { recipient: RecipientId },

    /// An identical notification was accepted within the dedup window.
    #[error("duplicate notification suppressed for recipient {recipient}")]
    DuplicateSuppressed { recipient: RecipientId },

    #[error("template not found: {name}")]
    TemplateNotFound { name: String },

    #[error("no provider configured for channel {channel}")]
    ProviderUnavailable { channel: Channel },

    #[error("delivery failed: {0}")]
    DeliveryFailed(#[from] ProviderError),

    #[error("notification {id} expired before delivery")]
    NotificationExpired { id: NotificationId },

    #[error("notification not found: {id}")]
    NotFound { id: NotificationId },

    /// The caller does not own the notification.
    #[error("notification {id} does not belong to recipient {recipient}")]
    Forbidden { id: NotificationId, recipient: RecipientId },

    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: NotificationId,
        from: NotificationStatus,
        to: NotificationStatus,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,
}

impl DispatchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether this error rejected the request at the admission gate.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            DispatchError::RateLimitExceeded { .. } | DispatchError::DuplicateSuppressed { .. }
        )
    }
}

/// A recipient that `send_bulk` skipped, with the reason.
#[derive(Debug)]
pub struct SkippedRecipient {
    pub recipient: String,
    pub reason: DispatchError,
}

/// Aggregated error for a bulk send that skipped some recipients.
#[derive(Debug, Default)]
pub struct BulkSendError {
    pub skipped: Vec<SkippedRecipient>,
}

impl BulkSendError {
    pub fn push(&mut self, recipient: impl Into<String>, reason: DispatchError) {
        self.skipped.push(SkippedRecipient {
            recipient: recipient.into(),
            reason,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.skipped.is_empty()
    }

    pub fn len(&self) -> usize {
        self.skipped.len()
    }
}

impl fmt::Display for BulkSendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} recipient(s) skipped", self.skipped.len())?;
        for (i, skipped) in self.skipped.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{:?}: {}", skipped.recipient, skipped.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for BulkSendError {}

/// Errors reported by a channel provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rejected notification: {0}")]
    Rejected(String),

    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
}

/// Errors from the notification or template store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(NotificationId),

    /// The record changed since it was read.
    #[error("version conflict on {id}: expected {expected}, found {found}")]
    Conflict {
        id: NotificationId,
        expected: u64,
        found: u64,
    },

    #[error("record already exists: {0}")]
    AlreadyExists(NotificationId),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(err: impl fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Errors from the cache collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cached value for {key} is not an integer")]
    NotAnInteger { key: String },
}

impl CacheError {
    pub fn backend(err: impl fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Errors from an event sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("event sink closed")]
    Closed,

    #[error("event sink error: {0}")]
    Backend(String),
}
