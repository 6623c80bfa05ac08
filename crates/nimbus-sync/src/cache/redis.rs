//! Redis cache tier.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::CacheStore;
use crate::connector::RedisConnector;
use crate::error::{SyncError, SyncResult};

/// Shared cache tier over a multiplexed, auto-reconnecting connection.
///
/// Nothing is dialed until the first call, so the tier can be built while
/// Redis is down; calls fail with [`SyncError::CacheBackend`] until it is up.
#[derive(Clone)]
pub struct RedisCache {
    redis: RedisConnector,
}

impl RedisCache {
    pub fn new(redis: RedisConnector) -> Self {
        RedisCache { redis }
    }

    /// Parses `url`; the connection is made lazily.
    pub fn open(url: &str) -> SyncResult<Self> {
        Ok(Self::new(RedisConnector::open(url)?))
    }

    async fn conn(&self) -> SyncResult<ConnectionManager> {
        self.redis.connection().await.map_err(backend)
    }
}

fn backend(err: redis::RedisError) -> SyncError {
    SyncError::CacheBackend(err.to_string())
}

#[async_trait]
impl CacheStore for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> SyncResult<()> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> SyncResult<bool> {
        let mut conn = self.conn().await?;
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(count > 0)
    }
}
