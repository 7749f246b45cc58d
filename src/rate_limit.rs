use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::cache::Cache;
use crate::error::CacheError;
use crate::types::RecipientId;

const WINDOW: Duration = Duration::from_secs(60);

/// Per-recipient admission budget over a fixed one-minute window.
///
/// Checking never consumes budget; the dispatcher calls [`RateLimiter::record`]
/// only after a notification is accepted. Two bursts straddling a window
/// boundary can together exceed the limit.
pub struct RateLimiter {
    cache: Arc<dyn Cache>,
    limit: u32,
    prefix: String,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn Cache>, limit: u32, prefix: impl Into<String>) -> Self {
        Self {
            cache,
            limit,
            prefix: prefix.into(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn key(&self, recipient: &RecipientId) -> String {
        format!("{}:rate:{}", self.prefix, recipient)
    }

    pub async fn current(&self, recipient: &RecipientId) -> Result<u64, CacheError> {
        let value = self.cache.get(&self.key(recipient)).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Whether the recipient still has budget in the current window.
    ///
    /// Cache failures admit the request.
    pub async fn check(&self, recipient: &RecipientId) -> bool {
        match self.current(recipient).await {
            Ok(count) => count < u64::from(self.limit),
            Err(err) => {
                warn!(recipient = %recipient, error = %err, "rate limit check failed; admitting");
                true
            }
        }
    }

    /// Count one accepted send against the recipient's window.
    pub async fn record(&self, recipient: &RecipientId) {
        let key = self.key(recipient);
        match self.cache.increment(&key).await {
            Ok(1) => {
                if let Err(err) = self.cache.expire(&key, WINDOW).await {
                    warn!(recipient = %recipient, error = %err, "failed to set rate counter expiry");
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(recipient = %recipient, error = %err, "failed to increment rate counter");
            }
        }
    }
}
