//! A notification dispatch engine.
//!
//! Turns a logical "notify user X" request into deliveries across push,
//! email, SMS and in-app channels.
//!
//! ## Guarantees
//! - Per-recipient rate limiting and duplicate suppression at admission
//! - Bounded delivery queue with a fixed worker pool
//! - Retries with capped backoff, scheduled and expiring notifications
//! - Best-effort, at-least-once delivery
//!
//! ## Non-Guarantees
//! - Exactly-once delivery across restarts
//! - Ordering between notifications, even to the same recipient
//! - Per-item outcomes inside a batch: a batch succeeds or fails as a whole
//!
//! The engine is passive with respect to time: the host calls
//! [`Dispatcher::process_scheduled`], [`Dispatcher::process_retries`] and
//! [`Dispatcher::cleanup`] from its own scheduler, or uses
//! [`spawn_maintenance`].

mod batch;
mod cache;
mod clock;
mod dedup;
mod dispatcher;
mod error;
mod events;
mod provider;
mod rate_limit;
mod retry;
mod storage;
mod sweeper;
mod telemetry;
mod template;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod cache_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

#[cfg(feature = "http")]
mod provider_http;

pub use cache::{Cache, InMemoryCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dedup::{fingerprint, DeduplicationFilter};
pub use dispatcher::{BulkSendOutcome, Dispatcher, DispatcherBuilder, DispatcherConfig};
pub use error::{
    BulkSendError,
    CacheError,
    DispatchError,
    EventError,
    ProviderError,
    SkippedRecipient,
    StoreError,
};
pub use events::{
    BroadcastEventSink,
    EventKind,
    EventPublisher,
    EventSink,
    MemoryEventSink,
    NoopEventSink,
    NotificationEvent,
};
pub use provider::{ChannelProvider, ProviderRegistry, ProviderRegistryBuilder};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use storage::{InMemoryNotificationStore, NotificationStore};
pub use sweeper::{spawn_maintenance, MaintenanceHandle, MaintenanceSchedule, SweepReport};
pub use template::{render, InMemoryTemplateStore, ResolvedContent, Template, TemplateResolver, TemplateStore};
pub use types::{
    BulkSendRequest,
    Channel,
    Notification,
    NotificationId,
    NotificationStatus,
    Priority,
    RecipientId,
    SendRequest,
    TemplateRef,
};
pub use worker::QueueFullPolicy;

#[cfg(feature = "redis")]
pub use cache_redis::RedisCache;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresNotificationStore;

#[cfg(feature = "http")]
pub use provider_http::HttpGatewayProvider;
