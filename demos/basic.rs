use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify_dispatch::{
    BulkSendRequest, Channel, ChannelProvider, Dispatcher, DispatcherConfig, Notification, ProviderError,
    ProviderRegistry, RecipientId, SendRequest,
};

/// Logs instead of calling a real gateway.
struct ConsoleProvider(&'static str);

#[async_trait]
impl ChannelProvider for ConsoleProvider {
    async fn send(&self, n: &Notification) -> Result<(), ProviderError> {
        tracing::info!(gateway = self.0, to = %n.recipient_id, title = %n.title, "delivered");
        Ok(())
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,notify_dispatch=debug".into()),
        )
        .init();

    let providers = ProviderRegistry::builder()
        .register(Channel::Push, Arc::new(ConsoleProvider("push")))?
        .register(Channel::Email, Arc::new(ConsoleProvider("smtp")))?
        .build();
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), providers);

    let created = dispatcher
        .send(
            SendRequest::new("user_42", "order_shipped", "Your order shipped", "Order #1001 is on its way")
                .with_channels([Channel::Push, Channel::Email]),
        )
        .await?;

    // The same request again is suppressed.
    let repeat = dispatcher
        .send(
            SendRequest::new("user_42", "order_shipped", "Your order shipped", "Order #1001 is on its way")
                .with_channels([Channel::Push, Channel::Email]),
        )
        .await;
    tracing::info!(result = ?repeat.err(), "second send");

    let outcome = dispatcher
        .send_bulk(BulkSendRequest {
            recipient_ids: vec!["user_1".into(), "user_2".into(), "user_3".into()],
            notification_type: "maintenance".into(),
            title: "Scheduled maintenance".into(),
            body: "We will be offline Sunday 02:00-03:00 UTC".into(),
            channels: vec![Channel::Push],
            ..Default::default()
        })
        .await?;
    match outcome.into_result() {
        Ok(bulk) => tracing::info!(created = bulk.len(), "bulk send"),
        Err((bulk, skipped)) => tracing::warn!(created = bulk.len(), %skipped, "bulk send incomplete"),
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    let user = RecipientId::new("user_42");
    dispatcher.mark_read(&created[0].id, &user).await?;
    for n in dispatcher.get_for_user(&user, 10, 0).await? {
        tracing::info!(id = %n.id, channel = %n.channel, status = %n.status, read = n.is_read(), "record");
    }

    dispatcher.shutdown().await;
    Ok(())
}
