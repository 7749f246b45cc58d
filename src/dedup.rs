use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::cache::Cache;

/// Suppresses identical notifications seen within a time window.
///
/// Like the rate limiter, the fingerprint is only written after the
/// notification has been accepted.
pub struct DeduplicationFilter {
    cache: Arc<dyn Cache>,
    window: Duration,
    prefix: String,
}

impl DeduplicationFilter {
    pub fn new(cache: Arc<dyn Cache>, window: Duration, prefix: impl Into<String>) -> Self {
        Self {
            cache,
            window,
            prefix: prefix.into(),
        }
    }

    fn key(&self, fingerprint: &str) -> String {
        format!("{}:dedup:{}", self.prefix, fingerprint)
    }

    /// Whether this fingerprint was accepted within the window.
    ///
    /// Cache failures are treated as unseen.
    pub async fn is_duplicate(&self, fingerprint: &str) -> bool {
        match self.cache.get(&self.key(fingerprint)).await {
            Ok(value) => value.is_some(),
            Err(err) => {
                warn!(error = %err, "dedup lookup failed; treating as unseen");
                false
            }
        }
    }

    pub async fn mark_seen(&self, fingerprint: &str) {
        if let Err(err) = self
            .cache
            .set_with_expiry(&self.key(fingerprint), "1", self.window)
            .await
        {
            warn!(error = %err, "failed to record dedup fingerprint");
        }
    }
}

/// Deterministic fingerprint of (recipient, type, title, body).
///
/// Fields are length-prefixed so that shifting text between fields
/// cannot produce the same digest.
pub fn fingerprint(recipient: &str, notification_type: &str, title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [recipient, notification_type, title, body] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::clock::ManualClock;

    #[test]
    fn fingerprint_is_deterministic_and_field_sensitive() {
        let a = fingerprint("u1", "order_shipped", "Shipped", "Your order shipped");
        let b = fingerprint("u1", "order_shipped", "Shipped", "Your order shipped");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, fingerprint("u2", "order_shipped", "Shipped", "Your order shipped"));
        assert_ne!(
            fingerprint("u1", "t", "ab", "c"),
            fingerprint("u1", "t", "a", "bc")
        );
    }

    #[tokio::test]
    async fn seen_fingerprints_expire_with_window() {
        let clock = ManualClock::default();
        let cache = Arc::new(InMemoryCache::with_clock(Arc::new(clock.clone())));
        let filter = DeduplicationFilter::new(cache, Duration::from_secs(300), "t");
        let fp = fingerprint("u1", "t", "a", "b");

        assert!(!filter.is_duplicate(&fp).await);
        filter.mark_seen(&fp).await;
        assert!(filter.is_duplicate(&fp).await);

        clock.advance(chrono::Duration::seconds(301));
        assert!(!filter.is_duplicate(&fp).await);
    }
}
