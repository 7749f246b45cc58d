use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{Notification, NotificationStatus};

/// Linear backoff for failed deliveries.
///
/// `delay = base_delay * multiplier * retry_count`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_delay: Duration::from_secs(600),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = self.multiplier.max(0.0) * f64::from(retry_count);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn can_retry(&self, notification: &Notification) -> bool {
        notification.retry_count < self.max_retries
    }

    /// A failed notification with retries left whose backoff has elapsed
    /// since its last update.
    pub fn is_eligible(&self, notification: &Notification, now: DateTime<Utc>) -> bool {
        if notification.status != NotificationStatus::Failed || !self.can_retry(notification) {
            return false;
        }
        let elapsed = (now - notification.updated_at).to_std().unwrap_or(Duration::ZERO);
        elapsed >= self.delay_for(notification.retry_count)
    }
}
