#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_dispatch::{
    ChannelProvider, Channel, Dispatcher, DispatcherConfig, InMemoryCache, InMemoryNotificationStore,
    InMemoryTemplateStore, ManualClock, MemoryEventSink, Notification, NotificationId, NotificationStatus,
    NotificationStore, ProviderError, ProviderRegistry, RecipientId, StoreError,
};
use tokio::sync::Semaphore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Provider whose outcome can be flipped mid-test; records every call.
#[derive(Default)]
pub struct ScriptedProvider {
    failure: Mutex<Option<ProviderError>>,
    pub single_calls: AtomicUsize,
    pub batch_calls: AtomicUsize,
    sent: Mutex<Vec<NotificationId>>,
}

impl ScriptedProvider {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(err: ProviderError) -> Arc<Self> {
        let provider = Self::default();
        *provider.failure.lock().unwrap() = Some(err);
        Arc::new(provider)
    }

    pub fn set_failure(&self, err: Option<ProviderError>) {
        *self.failure.lock().unwrap() = err;
    }

    pub fn sent(&self) -> Vec<NotificationId> {
        self.sent.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst) + self.batch_calls.load(Ordering::SeqCst)
    }

    fn outcome(&self, notifications: &[Notification]) -> Result<(), ProviderError> {
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        self.sent
            .lock()
            .unwrap()
            .extend(notifications.iter().map(|n| n.id.clone()));
        Ok(())
    }
}

#[async_trait]
impl ChannelProvider for ScriptedProvider {
    async fn send(&self, notification: &Notification) -> Result<(), ProviderError> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.outcome(std::slice::from_ref(notification))
    }

    async fn send_batch(&self, notifications: &[Notification]) -> Result<(), ProviderError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.outcome(notifications)
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Provider that blocks every call until permits are released.
pub struct GatedProvider {
    pub started: AtomicUsize,
    gate: Semaphore,
}

impl GatedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        })
    }

    pub fn open(&self) {
        self.gate.add_permits(1_000);
    }
}

#[async_trait]
impl ChannelProvider for GatedProvider {
    async fn send(&self, _notification: &Notification) -> Result<(), ProviderError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| ProviderError::Unavailable("gate closed".into()))?;
        permit.forget();
        Ok(())
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// In-memory store whose n-th `create` call fails.
pub struct FailingStore {
    inner: InMemoryNotificationStore,
    fail_on: usize,
    creates: AtomicUsize,
}

impl FailingStore {
    pub fn failing_create(nth: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryNotificationStore::new(),
            fail_on: nth,
            creates: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl NotificationStore for FailingStore {
    async fn create(&self, notification: &Notification) -> Result<(), StoreError> {
        if self.creates.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(StoreError::Backend("connection reset".into()));
        }
        self.inner.create(notification).await
    }

    async fn update(&self, notification: &Notification) -> Result<Notification, StoreError> {
        self.inner.update(notification).await
    }

    async fn get_by_id(&self, id: &NotificationId) -> Result<Option<Notification>, StoreError> {
        self.inner.get_by_id(id).await
    }

    async fn get_by_user_id(
        &self,
        recipient: &RecipientId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        self.inner.get_by_user_id(recipient, limit, offset).await
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<Notification>, StoreError> {
        self.inner.get_pending(limit).await
    }

    async fn get_failed(&self, max_retries: u32, limit: usize) -> Result<Vec<Notification>, StoreError> {
        self.inner.get_failed(max_retries, limit).await
    }

    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.cleanup_older_than(cutoff).await
    }
}

pub fn on<P: ChannelProvider + 'static>(channel: Channel, provider: &Arc<P>) -> (Channel, Arc<dyn ChannelProvider>) {
    let provider: Arc<dyn ChannelProvider> = provider.clone();
    (channel, provider)
}

pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub clock: ManualClock,
    pub cache: Arc<InMemoryCache>,
    pub events: Arc<MemoryEventSink>,
    pub templates: Arc<InMemoryTemplateStore>,
}

pub fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        worker_count: 2,
        queue_capacity: 64,
        provider_timeout_ms: 2_000,
        ..Default::default()
    }
}

pub fn harness(config: DispatcherConfig, providers: Vec<(Channel, Arc<dyn ChannelProvider>)>) -> Harness {
    build_harness(config, providers, None)
}

pub fn harness_with_store(
    config: DispatcherConfig,
    providers: Vec<(Channel, Arc<dyn ChannelProvider>)>,
    store: Arc<dyn NotificationStore>,
) -> Harness {
    build_harness(config, providers, Some(store))
}

fn build_harness(
    config: DispatcherConfig,
    providers: Vec<(Channel, Arc<dyn ChannelProvider>)>,
    store: Option<Arc<dyn NotificationStore>>,
) -> Harness {
    init_tracing();
    let clock = ManualClock::default();
    let cache = Arc::new(InMemoryCache::with_clock(Arc::new(clock.clone())));
    let events = Arc::new(MemoryEventSink::new());
    let templates = Arc::new(InMemoryTemplateStore::new());

    let mut registry = ProviderRegistry::builder();
    for (channel, provider) in providers {
        registry = registry.register(channel, provider).expect("provider config");
    }

    let mut builder = Dispatcher::builder(config)
        .providers(registry.build())
        .clock(Arc::new(clock.clone()))
        .cache(cache.clone())
        .events(events.clone())
        .templates(templates.clone());
    if let Some(store) = store {
        builder = builder.store(store);
    }
    let dispatcher = builder.build();

    Harness {
        dispatcher: Arc::new(dispatcher),
        clock,
        cache,
        events,
        templates,
    }
}

/// Poll until the record reaches `status` or two seconds pass.
pub async fn wait_for_status(dispatcher: &Dispatcher, id: &NotificationId, status: NotificationStatus) -> Notification {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = dispatcher.get(id).await.unwrap().expect("record exists");
        if current.status == status {
            return current;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{id} stuck in {} waiting for {status}", current.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `check` holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within 2s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
