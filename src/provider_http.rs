#[cfg(feature = "http")]
use std::time::Duration;

#[cfg(feature = "http")]
use async_trait::async_trait;

#[cfg(feature = "http")]
use crate::error::ProviderError;
#[cfg(feature = "http")]
use crate::provider::ChannelProvider;
#[cfg(feature = "http")]
use crate::types::Notification;

/// Posts notifications as JSON to an HTTP gateway.
///
/// Batches are sent as a single JSON array.
#[cfg(feature = "http")]
pub struct HttpGatewayProvider {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    auth_token: Option<String>,
}

#[cfg(feature = "http")]
impl HttpGatewayProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout: Duration::from_secs(5),
            auth_token: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    async fn post<T: serde::Serialize + ?Sized>(&self, body: &T) -> Result<(), ProviderError> {
        let mut request = self.client.post(&self.url).json(body).timeout(self.timeout);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) if resp.status().is_client_error() => Err(ProviderError::Rejected(format!(
                "gateway returned {}",
                resp.status()
            ))),
            Ok(resp) => Err(ProviderError::Unavailable(format!(
                "gateway returned {}",
                resp.status()
            ))),
            Err(err) if err.is_timeout() => Err(ProviderError::Timeout),
            Err(err) => Err(ProviderError::Unavailable(err.to_string())),
        }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl ChannelProvider for HttpGatewayProvider {
    async fn send(&self, notification: &Notification) -> Result<(), ProviderError> {
        self.post(notification).await
    }

    async fn send_batch(&self, notifications: &[Notification]) -> Result<(), ProviderError> {
        self.post(notifications).await
    }

    fn validate_config(&self) -> Result<(), ProviderError> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ProviderError::InvalidConfig(format!(
                "gateway url must be http(s): {:?}",
                self.url
            )));
        }
        if self.timeout.is_zero() {
            return Err(ProviderError::InvalidConfig("timeout must be non-zero".into()));
        }
        Ok(())
    }
}
