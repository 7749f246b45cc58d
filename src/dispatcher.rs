use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{Cache, InMemoryCache};
use crate::clock::{Clock, SystemClock};
use crate::dedup::{fingerprint, DeduplicationFilter};
use crate::error::{BulkSendError, DispatchError, StoreError};
use crate::events::{EventKind, EventPublisher, EventSink, NoopEventSink};
use crate::provider::ProviderRegistry;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::storage::{InMemoryNotificationStore, NotificationStore};
use crate::sweeper::{ScheduledSweeper, SweepReport};
use crate::telemetry::metric_inc;
use crate::template::{InMemoryTemplateStore, TemplateResolver, TemplateStore};
use crate::types::{
    BulkSendRequest, Channel, Notification, NotificationId, NotificationStatus, RecipientId, SendRequest,
};
use crate::worker::{DeliveryContext, JobQueue, QueueFullPolicy};

const MARK_READ_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Accepted sends per recipient per minute.
    pub rate_limit_per_minute: u32,
    pub dedup_enabled: bool,
    pub dedup_window_secs: u64,
    /// Deliver bulk sends and sweeps as per-channel batches.
    pub batching_enabled: bool,
    pub max_batch_size: usize,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub queue_full_policy: QueueFullPolicy,
    pub provider_timeout_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_backoff_multiplier: f64,
    pub retry_max_delay_ms: u64,
    pub max_retries: u32,
    /// Records fetched per sweep step.
    pub sweep_batch_size: usize,
    pub retention_days: u32,
    /// Namespace for cache keys.
    pub cache_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            rate_limit_per_minute: 60,
            dedup_enabled: true,
            dedup_window_secs: 300,
            batching_enabled: true,
            max_batch_size: 100,
            worker_count,
            queue_capacity: 1_000,
            queue_full_policy: QueueFullPolicy::DeferToSweep,
            provider_timeout_ms: 10_000,
            retry_base_delay_ms: 30_000,
            retry_backoff_multiplier: 2.0,
            retry_max_delay_ms: 600_000,
            max_retries: 3,
            sweep_batch_size: 100,
            retention_days: 30,
            cache_prefix: "notify".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            multiplier: self.retry_backoff_multiplier,
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            max_retries: self.max_retries,
        }
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

/// Result of a bulk send: what was created, and who was skipped and why.
#[derive(Debug, Default)]
pub struct BulkSendOutcome {
    pub created: Vec<Notification>,
    pub skipped: BulkSendError,
}

impl BulkSendOutcome {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    /// `Ok` only when no recipient was skipped.
    pub fn into_result(self) -> Result<Vec<Notification>, (Vec<Notification>, BulkSendError)> {
        if self.skipped.is_empty() {
            Ok(self.created)
        } else {
            Err((self.created, self.skipped))
        }
    }
}

/// Wires collaborators into a [`Dispatcher`]. Anything not supplied
/// falls back to the in-memory implementation.
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    providers: ProviderRegistry,
    store: Option<Arc<dyn NotificationStore>>,
    cache: Option<Arc<dyn Cache>>,
    templates: Option<Arc<dyn TemplateStore>>,
    events: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl DispatcherBuilder {
    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    pub fn store(mut self, store: Arc<dyn NotificationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn templates(mut self, templates: Arc<dyn TemplateStore>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the dispatcher and start its workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Dispatcher {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryNotificationStore::new()));
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(InMemoryCache::with_clock(clock.clone())));
        let templates = self
            .templates
            .unwrap_or_else(|| Arc::new(InMemoryTemplateStore::new()));
        let events = EventPublisher::new(self.events.unwrap_or_else(|| Arc::new(NoopEventSink)));

        let ctx = Arc::new(DeliveryContext::new(
            store.clone(),
            Arc::new(self.providers),
            events.clone(),
            clock.clone(),
            config.provider_timeout(),
        ));

        let (queue, worker_handles) = JobQueue::start(
            ctx.clone(),
            config.queue_capacity,
            config.worker_count,
            config.queue_full_policy,
            config.max_batch_size,
        );
        let queue = Arc::new(queue);

        let sweeper = ScheduledSweeper::new(
            store.clone(),
            ctx,
            queue.clone(),
            config.retry_policy(),
            config.sweep_batch_size,
            config.batching_enabled,
            config.retention(),
        );

        info!(
            workers = config.worker_count.max(1),
            rate_limit = config.rate_limit_per_minute,
            dedup = config.dedup_enabled,
            batching = config.batching_enabled,
            "notification dispatcher started"
        );

        Dispatcher {
            rate_limiter: RateLimiter::new(cache.clone(), config.rate_limit_per_minute, config.cache_prefix.clone()),
            dedup: DeduplicationFilter::new(cache, config.dedup_window(), config.cache_prefix.clone()),
            templates: TemplateResolver::new(templates),
            store,
            clock,
            events,
            queue,
            sweeper,
            is_running: AtomicBool::new(true),
            worker_handles: Mutex::new(worker_handles),
            config,
        }
    }
}

/// Turns "notify user X" requests into deliveries.
///
/// `send` and `send_bulk` return once records are created; provider calls
/// run on a bounded worker pool. Delivery failures are recorded on the
/// records, never returned to the caller.
pub struct Dispatcher {
    config: DispatcherConfig,
    store: Arc<dyn NotificationStore>,
    rate_limiter: RateLimiter,
    dedup: DeduplicationFilter,
    templates: TemplateResolver,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
    queue: Arc<JobQueue>,
    sweeper: ScheduledSweeper,
    is_running: AtomicBool,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Request fields after validation and template resolution.
struct Admitted {
    recipient: RecipientId,
    channels: Vec<Channel>,
    title: String,
    body: String,
}

impl Dispatcher {
    /// In-memory collaborators with the given providers.
    pub fn new(config: DispatcherConfig, providers: ProviderRegistry) -> Self {
        Self::builder(config).providers(providers).build()
    }

    pub fn builder(config: DispatcherConfig) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            providers: ProviderRegistry::default(),
            store: None,
            cache: None,
            templates: None,
            events: None,
            clock: None,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Accept a notification for one recipient, creating one record per
    /// requested channel.
    ///
    /// Returns the records as created (status `pending`); delivery of due
    /// records continues in the background.
    pub async fn send(&self, request: SendRequest) -> Result<Vec<Notification>, DispatchError> {
        self.ensure_running()?;
        let created = self.accept(&request).await?;
        self.dispatch_due(&created, false).await;
        Ok(created)
    }

    /// Accept the same notification for many recipients.
    ///
    /// Request-level problems fail the whole call before any side effect.
    /// Per-recipient rejections are collected in the outcome while the
    /// remaining recipients are still processed.
    pub async fn send_bulk(&self, request: BulkSendRequest) -> Result<BulkSendOutcome, DispatchError> {
        self.ensure_running()?;
        if request.recipient_ids.is_empty() {
            return Err(DispatchError::validation("at least one recipient is required"));
        }

        // Resolve shared content once; each recipient then goes through the
        // inline path.
        let mut shared = SendRequest {
            recipient_id: String::new(),
            notification_type: request.notification_type.clone(),
            title: request.title.clone(),
            body: request.body.clone(),
            template: request.template.clone(),
            channels: request.channels.clone(),
            priority: request.priority,
            scheduled_at: request.scheduled_at,
            expires_at: request.expires_at,
            data: request.data.clone(),
        };
        validate_shape(&shared, self.clock.now())?;
        let (title, body) = self.resolve_content(&shared).await?;
        shared.title = title;
        shared.body = body;
        shared.template = None;

        let mut outcome = BulkSendOutcome::default();
        for recipient in &request.recipient_ids {
            let mut single = shared.clone();
            single.recipient_id = recipient.clone();
            match self.accept(&single).await {
                Ok(created) => outcome.created.extend(created),
                Err(err) => {
                    if err.is_admission_rejection() {
                        debug!(recipient = %recipient, error = %err, "bulk send skipped recipient");
                    } else {
                        warn!(recipient = %recipient, error = %err, "bulk send skipped recipient");
                    }
                    outcome.skipped.push(recipient.clone(), err);
                }
            }
        }

        info!(
            created = outcome.created.len(),
            skipped = outcome.skipped.len(),
            "bulk send accepted"
        );
        self.dispatch_due(&outcome.created, self.config.batching_enabled)
            .await;
        Ok(outcome)
    }

    /// Mark a notification read on behalf of its recipient.
    ///
    /// Marking an already-read notification is a no-op.
    pub async fn mark_read(&self, id: &NotificationId, recipient: &RecipientId) -> Result<(), DispatchError> {
        for _ in 0..MARK_READ_ATTEMPTS {
            let mut notification = self
                .store
                .get_by_id(id)
                .await?
                .ok_or_else(|| DispatchError::NotFound { id: id.clone() })?;

            if &notification.recipient_id != recipient {
                return Err(DispatchError::Forbidden {
                    id: id.clone(),
                    recipient: recipient.clone(),
                });
            }
            if notification.is_read() {
                return Ok(());
            }

            let now = self.clock.now();
            notification.read_at = Some(now);
            match self.store.update(&notification).await {
                Ok(stored) => {
                    debug!(notification_id = %id, "notification read");
                    self.events.publish(EventKind::Read, &stored, now).await;
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Err(StoreError::Backend(format!("gave up marking {id} read after repeated conflicts")).into())
    }

    /// A page of the recipient's notifications, newest first.
    pub async fn get_for_user(
        &self,
        recipient: &RecipientId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Notification>, DispatchError> {
        Ok(self.store.get_by_user_id(recipient, limit, offset).await?)
    }

    pub async fn get(&self, id: &NotificationId) -> Result<Option<Notification>, DispatchError> {
        Ok(self.store.get_by_id(id).await?)
    }

    /// Expire stale pending records and dispatch due ones.
    pub async fn process_scheduled(&self) -> Result<SweepReport, DispatchError> {
        self.sweeper.process_scheduled().await
    }

    /// Re-arm and re-dispatch failed records whose backoff has elapsed.
    pub async fn process_retries(&self) -> Result<SweepReport, DispatchError> {
        self.sweeper.process_retries().await
    }

    /// Purge records older than the retention period.
    pub async fn cleanup(&self) -> Result<SweepReport, DispatchError> {
        self.sweeper.cleanup().await
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop accepting work and wait for queued deliveries to finish.
    pub async fn shutdown(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.queue.close().await;

        let handles: Vec<_> = self.worker_handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("notification dispatcher stopped");
    }

    fn ensure_running(&self) -> Result<(), DispatchError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(DispatchError::Shutdown)
        }
    }

    /// Validation, template resolution and admission for one recipient,
    /// then record creation.
    async fn accept(&self, request: &SendRequest) -> Result<Vec<Notification>, DispatchError> {
        let now = self.clock.now();
        let admitted = self.validate(request, now).await?;

        if !self.rate_limiter.check(&admitted.recipient).await {
            metric_inc("notify.admission.rate_limited");
            info!(
                recipient = %admitted.recipient,
                limit = self.rate_limiter.limit(),
                "rate limit exceeded"
            );
            return Err(DispatchError::RateLimitExceeded {
                recipient: admitted.recipient,
            });
        }

        let fp = fingerprint(
            admitted.recipient.as_str(),
            &request.notification_type,
            &admitted.title,
            &admitted.body,
        );
        if self.config.dedup_enabled && self.dedup.is_duplicate(&fp).await {
            metric_inc("notify.admission.duplicate");
            info!(recipient = %admitted.recipient, "duplicate notification suppressed");
            return Err(DispatchError::DuplicateSuppressed {
                recipient: admitted.recipient,
            });
        }

        let mut created = Vec::with_capacity(admitted.channels.len());
        for channel in &admitted.channels {
            let notification = Notification {
                id: NotificationId::generate(),
                recipient_id: admitted.recipient.clone(),
                notification_type: request.notification_type.clone(),
                title: admitted.title.clone(),
                body: admitted.body.clone(),
                channel: *channel,
                priority: request.priority,
                status: NotificationStatus::Pending,
                scheduled_at: request.scheduled_at,
                expires_at: request.expires_at,
                retry_count: 0,
                last_error: None,
                sent_at: None,
                read_at: None,
                created_at: now,
                updated_at: now,
                metadata: request.data.clone(),
                version: 0,
            };
            if let Err(err) = self.store.create(&notification).await {
                warn!(
                    recipient = %admitted.recipient,
                    created = created.len(),
                    error = %err,
                    "failed to create notification record"
                );
                self.retire(created, now).await;
                return Err(err.into());
            }
            created.push(notification);
        }

        self.rate_limiter.record(&admitted.recipient).await;
        if self.config.dedup_enabled {
            self.dedup.mark_seen(&fp).await;
        }

        metric_inc("notify.admission.accepted");
        debug!(
            recipient = %admitted.recipient,
            records = created.len(),
            scheduled = request.scheduled_at.is_some(),
            "notification accepted"
        );
        Ok(created)
    }

    /// Expire records created for a request that then failed, so a sweep
    /// never delivers them and a retried request starts clean.
    async fn retire(&self, created: Vec<Notification>, now: DateTime<Utc>) {
        for mut notification in created {
            if let Err(err) = notification.mark_expired(now) {
                warn!(error = %err, "unexpected status transition");
                continue;
            }
            if let Err(err) = self.store.update(&notification).await {
                warn!(
                    notification_id = %notification.id,
                    error = %err,
                    "failed to retire partially created notification"
                );
            }
        }
    }

    async fn validate(&self, request: &SendRequest, now: DateTime<Utc>) -> Result<Admitted, DispatchError> {
        let recipient = request.recipient_id.trim();
        if recipient.is_empty() {
            return Err(DispatchError::validation("recipient_id is required"));
        }
        let channels = validate_shape(request, now)?;
        let (title, body) = self.resolve_content(request).await?;

        Ok(Admitted {
            recipient: RecipientId::new(recipient),
            channels,
            title,
            body,
        })
    }

    async fn resolve_content(&self, request: &SendRequest) -> Result<(String, String), DispatchError> {
        let (title, body) = match &request.template {
            Some(template) => {
                let resolved = self.templates.resolve(&template.name, &template.variables).await?;
                (resolved.title, resolved.body)
            }
            None => (request.title.clone(), request.body.clone()),
        };

        if title.trim().is_empty() || body.trim().is_empty() {
            return Err(DispatchError::validation("title and body must not be empty"));
        }
        Ok((title, body))
    }

    async fn dispatch_due(&self, created: &[Notification], batched: bool) {
        let now = self.clock.now();
        let due: Vec<Notification> = created
            .iter()
            .filter(|n| n.is_due_at(now))
            .cloned()
            .collect();
        if due.is_empty() {
            return;
        }
        let enqueued = self.queue.submit(&due, batched).await;
        if enqueued < due.len() {
            debug!(
                due = due.len(),
                enqueued,
                "some records left pending for the next sweep"
            );
        }
    }
}

/// Checks that do not depend on the recipient or on any collaborator.
/// Returns the requested channels with duplicates removed.
fn validate_shape(request: &SendRequest, now: DateTime<Utc>) -> Result<Vec<Channel>, DispatchError> {
    if request.notification_type.trim().is_empty() {
        return Err(DispatchError::validation("notification_type is required"));
    }

    if request.channels.is_empty() {
        return Err(DispatchError::validation("at least one channel is required"));
    }
    let mut seen = HashSet::new();
    let channels: Vec<Channel> = request
        .channels
        .iter()
        .copied()
        .filter(|c| seen.insert(*c))
        .collect();

    match &request.template {
        Some(template) => {
            if template.name.trim().is_empty() {
                return Err(DispatchError::validation("template name must not be empty"));
            }
            if !request.title.is_empty() || !request.body.is_empty() {
                return Err(DispatchError::validation(
                    "provide either title/body or a template, not both",
                ));
            }
        }
        None => {
            if request.title.trim().is_empty() || request.body.trim().is_empty() {
                return Err(DispatchError::validation(
                    "title and body are required when no template is given",
                ));
            }
        }
    }

    if let Some(expires_at) = request.expires_at {
        if expires_at <= now {
            return Err(DispatchError::validation("expires_at is in the past"));
        }
        if request.scheduled_at.is_some_and(|at| at >= expires_at) {
            return Err(DispatchError::validation("expires_at must be after scheduled_at"));
        }
    }

    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TemplateRef;

    fn base() -> SendRequest {
        SendRequest::new("u1", "order_shipped", "Shipped", "Your order shipped").with_channels([Channel::Push])
    }

    #[test]
    fn shape_rejects_missing_fields() {
        let now = Utc::now();
        let mut r = base();
        r.notification_type.clear();
        assert!(validate_shape(&r, now).is_err());

        let r = base().with_channels(Vec::<Channel>::new());
        assert!(validate_shape(&r, now).is_err());

        let mut r = base();
        r.body = "   ".into();
        assert!(validate_shape(&r, now).is_err());
    }

    #[test]
    fn shape_rejects_mixed_content_forms() {
        let mut r = base();
        r.template = Some(TemplateRef::new("welcome"));
        assert!(matches!(validate_shape(&r, Utc::now()), Err(DispatchError::Validation(_))));
    }

    #[test]
    fn shape_checks_expiry_window() {
        let now = Utc::now();
        let past = base().expires_at(now - chrono::Duration::seconds(1));
        assert!(validate_shape(&past, now).is_err());

        let inverted = base()
            .scheduled_at(now + chrono::Duration::hours(2))
            .expires_at(now + chrono::Duration::hours(1));
        assert!(validate_shape(&inverted, now).is_err());

        let ok = base()
            .scheduled_at(now + chrono::Duration::hours(1))
            .expires_at(now + chrono::Duration::hours(2));
        assert!(validate_shape(&ok, now).is_ok());
    }

    #[test]
    fn shape_dedupes_channels_in_order() {
        let r = base().with_channels([Channel::Email, Channel::Push, Channel::Email]);
        assert_eq!(
            validate_shape(&r, Utc::now()).unwrap(),
            vec![Channel::Email, Channel::Push]
        );
    }

    #[test]
    fn config_defaults_match_documented_values() {
        let config = DispatcherConfig::default();
        assert_eq!(config.rate_limit_per_minute, 60);
        assert_eq!(config.dedup_window(), Duration::from_secs(300));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.retention(), chrono::Duration::days(30));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: DispatcherConfig =
            serde_json::from_str(r#"{"rate_limit_per_minute": 5, "queue_full_policy": "block"}"#).unwrap();
        assert_eq!(config.rate_limit_per_minute, 5);
        assert_eq!(config.queue_full_policy, QueueFullPolicy::Block);
        assert!(config.dedup_enabled);
    }
}
