use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::ProviderError;
use crate::types::{Channel, Notification};

/// Sender for one delivery channel.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), ProviderError>;

    /// Deliver a group as one unit. The default sends one by one and
    /// stops at the first error.
    async fn send_batch(&self, notifications: &[Notification]) -> Result<(), ProviderError> {
        for notification in notifications {
            self.send(notification).await?;
        }
        Ok(())
    }

    /// Checked once, when the provider is registered.
    fn validate_config(&self) -> Result<(), ProviderError>;

    /// Providers returning false get their groups delivered item by item.
    fn supports_batch(&self) -> bool {
        true
    }
}

/// Providers keyed by channel. Built once at startup and read-only after.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<Channel, Arc<dyn ChannelProvider>>,
}

impl ProviderRegistry {
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    pub fn get(&self, channel: Channel) -> Option<&Arc<dyn ChannelProvider>> {
        self.providers.get(&channel)
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.providers.contains_key(&channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.providers.keys().copied()
    }
}

#[derive(Default)]
pub struct ProviderRegistryBuilder {
    providers: HashMap<Channel, Arc<dyn ChannelProvider>>,
}

impl ProviderRegistryBuilder {
    /// Register a provider, failing if its configuration does not validate.
    /// A later registration for the same channel replaces the earlier one.
    pub fn register(
        mut self,
        channel: Channel,
        provider: Arc<dyn ChannelProvider>,
    ) -> Result<Self, ProviderError> {
        provider.validate_config()?;
        info!(channel = %channel, "registered channel provider");
        self.providers.insert(channel, provider);
        Ok(self)
    }

    pub fn build(self) -> ProviderRegistry {
        ProviderRegistry {
            providers: self.providers,
        }
    }
}
