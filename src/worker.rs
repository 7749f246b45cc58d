use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batch::BatchDeliverer;
use crate::clock::Clock;
use crate::error::{DispatchError, ProviderError, StoreError};
use crate::events::{EventKind, EventPublisher};
use crate::provider::ProviderRegistry;
use crate::storage::NotificationStore;
use crate::telemetry::{metric_inc, metric_inc_channel};
use crate::types::{Channel, Notification, NotificationId};

/// What to do when the delivery queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullPolicy {
    /// Leave the record pending; the next sweep picks it up.
    #[default]
    DeferToSweep,
    /// Wait for queue capacity.
    Block,
}

/// A unit of work consumed by workers.
#[derive(Debug, Clone)]
pub(crate) enum DeliveryJob {
    Single(NotificationId),
    Batch {
        channel: Channel,
        ids: Vec<NotificationId>,
    },
}

impl DeliveryJob {
    fn ids(&self) -> Vec<NotificationId> {
        match self {
            DeliveryJob::Single(id) => vec![id.clone()],
            DeliveryJob::Batch { ids, .. } => ids.clone(),
        }
    }
}

/// Shared context for all workers.
pub(crate) struct DeliveryContext {
    pub store: Arc<dyn NotificationStore>,
    pub registry: Arc<ProviderRegistry>,
    pub events: EventPublisher,
    pub clock: Arc<dyn Clock>,
    pub provider_timeout: Duration,

    /// Records currently owned by a queued or running job.
    claims: Mutex<HashSet<NotificationId>>,
}

impl DeliveryContext {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        registry: Arc<ProviderRegistry>,
        events: EventPublisher,
        clock: Arc<dyn Clock>,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            clock,
            provider_timeout,
            claims: Mutex::new(HashSet::new()),
        }
    }

    /// Claim the given records, returning only those nobody else holds.
    pub async fn claim(&self, ids: Vec<NotificationId>) -> Vec<NotificationId> {
        let mut guard = self.claims.lock().await;
        ids.into_iter().filter(|id| guard.insert(id.clone())).collect()
    }

    pub async fn release(&self, ids: &[NotificationId]) {
        let mut guard = self.claims.lock().await;
        for id in ids {
            guard.remove(id);
        }
    }

    pub async fn is_claimed(&self, id: &NotificationId) -> bool {
        self.claims.lock().await.contains(id)
    }

    /// Re-read a record and return it only if it is still pending.
    pub async fn load_pending(&self, id: &NotificationId) -> Option<Notification> {
        match self.store.get_by_id(id).await {
            Ok(Some(n)) if n.status == crate::types::NotificationStatus::Pending => Some(n),
            Ok(Some(n)) => {
                debug!(notification_id = %id, status = %n.status, "skipping delivery; no longer pending");
                None
            }
            Ok(None) => {
                warn!(notification_id = %id, "skipping delivery; record not found");
                None
            }
            Err(err) => {
                warn!(notification_id = %id, error = %err, "failed to load notification for delivery");
                None
            }
        }
    }

    /// Run a provider call under the configured deadline.
    pub async fn call_provider<F>(&self, call: F) -> Result<(), ProviderError>
    where
        F: Future<Output = Result<(), ProviderError>>,
    {
        match tokio::time::timeout(self.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        }
    }

    async fn persist(&self, notification: &Notification) -> bool {
        match self.store.update(notification).await {
            Ok(_) => true,
            Err(StoreError::Conflict { .. }) => {
                warn!(
                    notification_id = %notification.id,
                    status = %notification.status,
                    "record changed concurrently; dropping status update"
                );
                metric_inc("notify.store.conflict");
                false
            }
            Err(err) => {
                warn!(notification_id = %notification.id, error = %err, "failed to persist status update");
                false
            }
        }
    }

    /// pending -> sent -> delivered, stamped with `at`.
    pub async fn record_delivered(&self, mut notification: Notification, at: DateTime<Utc>) {
        if let Err(err) = notification
            .mark_sent(at)
            .and_then(|_| notification.mark_delivered(at))
        {
            warn!(error = %err, "unexpected status transition");
            return;
        }
        if !self.persist(&notification).await {
            return;
        }

        debug!(
            notification_id = %notification.id,
            recipient = %notification.recipient_id,
            channel = %notification.channel,
            "notification delivered"
        );
        metric_inc_channel("notify.delivery.delivered", notification.channel);
        self.events.publish(EventKind::Sent, &notification, at).await;
        self.events.publish(EventKind::Delivered, &notification, at).await;
    }

    pub async fn record_failed(&self, mut notification: Notification, error: String, at: DateTime<Utc>) {
        if let Err(err) = notification.mark_failed(error, at) {
            warn!(error = %err, "unexpected status transition");
            return;
        }
        if !self.persist(&notification).await {
            return;
        }

        warn!(
            notification_id = %notification.id,
            recipient = %notification.recipient_id,
            channel = %notification.channel,
            retry_count = notification.retry_count,
            error = notification.last_error.as_deref().unwrap_or_default(),
            "notification delivery failed"
        );
        metric_inc_channel("notify.delivery.failed", notification.channel);
        self.events.publish(EventKind::Failed, &notification, at).await;
    }

    pub async fn record_expired(&self, mut notification: Notification, at: DateTime<Utc>) -> bool {
        if let Err(err) = notification.mark_expired(at) {
            warn!(error = %err, "unexpected status transition");
            return false;
        }
        if !self.persist(&notification).await {
            return false;
        }

        let reason = DispatchError::NotificationExpired {
            id: notification.id.clone(),
        };
        info!(recipient = %notification.recipient_id, "{reason}");
        metric_inc_channel("notify.delivery.expired", notification.channel);
        true
    }

    /// Attempt one already-loaded pending notification.
    pub async fn deliver_loaded(&self, notification: Notification) {
        let now = self.clock.now();
        if notification.is_expired_at(now) {
            self.record_expired(notification, now).await;
            return;
        }

        let Some(provider) = self.registry.get(notification.channel).cloned() else {
            let err = DispatchError::ProviderUnavailable {
                channel: notification.channel,
            };
            self.record_failed(notification, err.to_string(), now).await;
            return;
        };

        let result = self.call_provider(provider.send(&notification)).await;
        let at = self.clock.now();
        match result {
            Ok(()) => self.record_delivered(notification, at).await,
            Err(err) => {
                let error = DispatchError::DeliveryFailed(err).to_string();
                self.record_failed(notification, error, at).await
            }
        }
    }
}

/// Bounded queue in front of the worker pool.
pub(crate) struct JobQueue {
    tx: RwLock<Option<mpsc::Sender<DeliveryJob>>>,
    ctx: Arc<DeliveryContext>,
    policy: QueueFullPolicy,
    max_batch_size: usize,
}

impl JobQueue {
    /// Create the queue and spawn `worker_count` workers consuming it.
    pub fn start(
        ctx: Arc<DeliveryContext>,
        capacity: usize,
        worker_count: usize,
        policy: QueueFullPolicy,
        max_batch_size: usize,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shared_rx = Arc::new(Mutex::new(rx));
        let batcher = Arc::new(BatchDeliverer::new(ctx.clone()));

        let handles = (0..worker_count.max(1))
            .map(|_| tokio::spawn(worker_loop(shared_rx.clone(), ctx.clone(), batcher.clone())))
            .collect();

        let queue = Self {
            tx: RwLock::new(Some(tx)),
            ctx,
            policy,
            max_batch_size: max_batch_size.max(1),
        };
        (queue, handles)
    }

    /// Hand notifications to the workers. With `batched`, records are grouped
    /// by channel and chunked; otherwise each record is its own job.
    /// Returns how many records were enqueued.
    pub async fn submit(&self, notifications: &[Notification], batched: bool) -> usize {
        let mut jobs = Vec::new();
        if batched {
            for (channel, group) in BatchDeliverer::group_by_channel(notifications.to_vec()) {
                for chunk in group.chunks(self.max_batch_size) {
                    let ids = chunk.iter().map(|n| n.id.clone()).collect::<Vec<_>>();
                    jobs.push((channel, ids));
                }
            }
        } else {
            for n in notifications {
                jobs.push((n.channel, vec![n.id.clone()]));
            }
        }

        let mut enqueued = 0;
        for (channel, ids) in jobs {
            let ids = self.ctx.claim(ids).await;
            if ids.is_empty() {
                continue;
            }
            let count = ids.len();
            let job = if batched {
                DeliveryJob::Batch {
                    channel,
                    ids: ids.clone(),
                }
            } else {
                DeliveryJob::Single(ids[0].clone())
            };

            if self.enqueue(job).await {
                enqueued += count;
            } else {
                self.ctx.release(&ids).await;
            }
        }
        enqueued
    }

    async fn enqueue(&self, job: DeliveryJob) -> bool {
        let guard = self.tx.read().await;
        let Some(tx) = guard.as_ref() else {
            debug!("delivery queue closed; records stay pending");
            return false;
        };

        match tx.try_send(job) {
            Ok(()) => {
                metric_inc("notify.queue.enqueued");
                true
            }
            Err(mpsc::error::TrySendError::Full(job)) => match self.policy {
                QueueFullPolicy::DeferToSweep => {
                    warn!("delivery queue full; deferring to next sweep");
                    metric_inc("notify.queue.deferred");
                    false
                }
                QueueFullPolicy::Block => {
                    let sent = tx.send(job).await.is_ok();
                    if sent {
                        metric_inc("notify.queue.enqueued");
                    }
                    sent
                }
            },
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Stop accepting jobs. Workers drain what is already queued.
    pub async fn close(&self) {
        self.tx.write().await.take();
    }
}

/// Main worker loop: pull a job, deliver it, release its claims.
async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    ctx: Arc<DeliveryContext>,
    batcher: Arc<BatchDeliverer>,
) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(job) = job else { break };
        let ids = job.ids();

        match job {
            DeliveryJob::Single(id) => {
                if let Some(notification) = ctx.load_pending(&id).await {
                    ctx.deliver_loaded(notification).await;
                }
            }
            DeliveryJob::Batch { channel, ids } => {
                batcher.deliver_ids(channel, &ids).await;
            }
        }

        ctx.release(&ids).await;
    }
}
