//! Redis-backed tracker shared by every server instance.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::keys::{parse_subscription_key, subscription_key, subscription_pattern};
use nimbus_core::ScopeKey;
use redis::aio::ConnectionManager;
use redis::{Script, Value};
use tracing::{debug, warn};

use super::SubscriptionTracker;
use crate::connector::RedisConnector;
use crate::error::{SyncError, SyncResult};

/// Decrements and deletes the key once it reaches zero. A missing key is
/// created at -1 by DECR and removed again, so the result is floored at 0.
const DECREMENT_SCRIPT: &str = r#"
local n = redis.call('DECR', KEYS[1])
if n <= 0 then
    redis.call('DEL', KEYS[1])
    return 0
end
return n
"#;

const SCAN_BATCH: usize = 500;

pub struct RedisTracker {
    redis: RedisConnector,
    ttl: Duration,
    decrement: Script,
}

impl RedisTracker {
    pub fn new(redis: RedisConnector, ttl: Duration) -> Self {
        RedisTracker {
            redis,
            ttl,
            decrement: Script::new(DECREMENT_SCRIPT),
        }
    }

    async fn conn(&self) -> SyncResult<ConnectionManager> {
        self.redis.connection().await.map_err(unavailable)
    }
}

fn unavailable(err: redis::RedisError) -> SyncError {
    SyncError::TrackerUnavailable(err.to_string())
}

/// Adds the positive counters of one MGET batch to `counts`.
///
/// A key that does not parse or a value that is not a count only loses
/// that one entry.
fn collect_counts(keys: &[String], values: Vec<Value>, counts: &mut HashMap<ScopeKey, u64>) {
    for (key, value) in keys.iter().zip(values) {
        let count = match redis::from_redis_value::<Option<u64>>(&value) {
            Ok(Some(count)) if count > 0 => count,
            Ok(_) => continue,
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping malformed subscription counter");
                continue;
            }
        };
        match parse_subscription_key(key) {
            Ok(scope) => {
                counts.insert(scope, count);
            }
            Err(e) => debug!(key = %key, error = %e, "Skipping malformed subscription key"),
        }
    }
}

#[async_trait]
impl SubscriptionTracker for RedisTracker {
    async fn increment(&self, scope: &ScopeKey) -> SyncResult<u64> {
        let key = subscription_key(scope);
        let mut conn = self.conn().await?;
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&key)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl.as_secs().max(1))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(count)
    }

    async fn decrement(&self, scope: &ScopeKey) -> SyncResult<u64> {
        let key = subscription_key(scope);
        let mut conn = self.conn().await?;
        let remaining: i64 = self
            .decrement
            .key(&key)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(remaining.max(0) as u64)
    }

    async fn snapshot_counts(&self) -> SyncResult<HashMap<ScopeKey, u64>> {
        let mut conn = self.conn().await?;
        let pattern = subscription_pattern();
        let mut counts = HashMap::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;

            if !keys.is_empty() {
                let values: Vec<Value> = redis::cmd("MGET")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(unavailable)?;
                collect_counts(&keys, values, &mut counts);
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(counts)
    }
}
