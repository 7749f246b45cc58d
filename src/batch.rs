use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::DispatchError;
use crate::telemetry::metric_inc_channel;
use crate::types::{Channel, Notification, NotificationId};
use crate::worker::DeliveryContext;

/// Delivers groups of notifications that share a channel.
///
/// A group is all-or-nothing: one successful batch call marks every
/// member delivered with the same timestamp, one failed call marks every
/// member failed with the same error. Per-item outcomes inside a batch
/// are not distinguished.
pub(crate) struct BatchDeliverer {
    ctx: Arc<DeliveryContext>,
}

impl BatchDeliverer {
    pub fn new(ctx: Arc<DeliveryContext>) -> Self {
        Self { ctx }
    }

    pub fn group_by_channel(notifications: Vec<Notification>) -> BTreeMap<Channel, Vec<Notification>> {
        let mut groups: BTreeMap<Channel, Vec<Notification>> = BTreeMap::new();
        for n in notifications {
            groups.entry(n.channel).or_default().push(n);
        }
        groups
    }

    /// Reload the records, expire stale ones, and deliver the rest as one group.
    pub async fn deliver_ids(&self, channel: Channel, ids: &[NotificationId]) {
        let now = self.ctx.clock.now();
        let mut live = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(n) = self.ctx.load_pending(id).await else { continue };
            if n.is_expired_at(now) {
                self.ctx.record_expired(n, now).await;
            } else {
                live.push(n);
            }
        }
        self.deliver_group(channel, live).await;
    }

    pub async fn deliver_group(&self, channel: Channel, group: Vec<Notification>) {
        if group.is_empty() {
            return;
        }

        let Some(provider) = self.ctx.registry.get(channel).cloned() else {
            let error = DispatchError::ProviderUnavailable { channel }.to_string();
            let now = self.ctx.clock.now();
            for n in group {
                self.ctx.record_failed(n, error.clone(), now).await;
            }
            return;
        };

        if !provider.supports_batch() {
            debug!(channel = %channel, size = group.len(), "provider has no batch support; sending individually");
            for n in group {
                self.ctx.deliver_loaded(n).await;
            }
            return;
        }

        let size = group.len();
        let result = self.ctx.call_provider(provider.send_batch(&group)).await;
        let at = self.ctx.clock.now();

        match result {
            Ok(()) => {
                info!(channel = %channel, size, "batch delivered");
                metric_inc_channel("notify.batch.delivered", channel);
                for n in group {
                    self.ctx.record_delivered(n, at).await;
                }
            }
            Err(err) => {
                let error = DispatchError::DeliveryFailed(err).to_string();
                info!(channel = %channel, size, error = %error, "batch failed");
                metric_inc_channel("notify.batch.failed", channel);
                for n in group {
                    self.ctx.record_failed(n, error.clone(), at).await;
                }
            }
        }
    }
}
