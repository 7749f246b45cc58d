#[cfg(feature = "redis")]
use std::time::Duration;

#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use redis::AsyncCommands;

#[cfg(feature = "redis")]
use crate::cache::Cache;
#[cfg(feature = "redis")]
use crate::error::CacheError;

/// Redis-backed cache. Shares counters and fingerprints across processes.
#[cfg(feature = "redis")]
pub struct RedisCache {
    client: redis::Client,
}

#[cfg(feature = "redis")]
impl RedisCache {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(CacheError::backend)?;
        Ok(Self::new(client))
    }

    async fn connection(&self) -> Result<redis::aio::Connection, CacheError> {
        self.client
            .get_tokio_connection()
            .await
            .map_err(CacheError::backend)
    }
}

#[cfg(feature = "redis")]
fn ttl_secs(ttl: Duration) -> usize {
    ttl.as_secs().max(1) as usize
}

#[cfg(feature = "redis")]
#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        conn.get(key).await.map_err(CacheError::backend)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) => conn
                .set_ex(key, value, ttl_secs(ttl))
                .await
                .map_err(CacheError::backend),
            None => conn.set(key, value).await.map_err(CacheError::backend),
        }
    }

    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.connection().await?;
        conn.incr(key, 1i64).await.map_err(|err| {
            if err.kind() == redis::ErrorKind::TypeError || err.kind() == redis::ErrorKind::ResponseError {
                CacheError::NotAnInteger { key: key.to_string() }
            } else {
                CacheError::backend(err)
            }
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        conn.expire(key, ttl_secs(ttl))
            .await
            .map_err(CacheError::backend)
    }
}
