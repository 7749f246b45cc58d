use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify_dispatch::{
    spawn_maintenance, Channel, ChannelProvider, Dispatcher, DispatcherConfig, MaintenanceSchedule, Notification,
    NotificationStatus, ProviderError, ProviderRegistry, SendRequest,
};

/// Fails the first attempt for every notification, then succeeds.
#[derive(Default)]
struct FlakySms {
    attempts: tokio::sync::Mutex<std::collections::HashSet<String>>,
}

#[async_trait]
impl ChannelProvider for FlakySms {
    async fn send(&self, n: &Notification) -> Result<(), ProviderError> {
        if self.attempts.lock().await.insert(n.id.to_string()) {
            return Err(ProviderError::Unavailable("carrier busy".into()));
        }
        tracing::info!(to = %n.recipient_id, body = %n.body, "sms sent");
        Ok(())
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn supports_batch(&self) -> bool {
        false
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = DispatcherConfig {
        retry_base_delay_ms: 500,
        ..Default::default()
    };
    let providers = ProviderRegistry::builder()
        .register(Channel::Sms, Arc::new(FlakySms::default()))?
        .build();
    let dispatcher = Arc::new(Dispatcher::new(config, providers));

    let now = chrono::Utc::now();
    let created = dispatcher
        .send(
            SendRequest::new("user_7", "reminder", "Reminder", "Standup in 5 minutes")
                .with_channels([Channel::Sms])
                .scheduled_at(now + chrono::Duration::seconds(2))
                .expires_at(now + chrono::Duration::minutes(5)),
        )
        .await?;
    let id = created[0].id.clone();

    let maintenance = spawn_maintenance(
        dispatcher.clone(),
        MaintenanceSchedule {
            sweep_interval_secs: 1,
            ..Default::default()
        },
    );

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Some(n) = dispatcher.get(&id).await? {
            tracing::info!(status = %n.status, retries = n.retry_count, error = ?n.last_error, "poll");
            if matches!(n.status, NotificationStatus::Delivered | NotificationStatus::Expired) {
                break;
            }
        }
    }

    maintenance.stop().await;
    dispatcher.shutdown().await;
    Ok(())
}
