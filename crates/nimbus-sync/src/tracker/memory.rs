//! Single-process tracker.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::ScopeKey;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::SubscriptionTracker;
use crate::error::SyncResult;

struct Counter {
    count: u64,
    refreshed_at: Instant,
}

/// Counter map for deployments without Redis, and for tests.
pub struct MemoryTracker {
    counters: Mutex<HashMap<ScopeKey, Counter>>,
    ttl: Duration,
}

impl MemoryTracker {
    pub fn new(ttl: Duration) -> Self {
        MemoryTracker {
            counters: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn live(&self, counter: &Counter, now: Instant) -> bool {
        counter.count > 0 && (self.ttl.is_zero() || now.duration_since(counter.refreshed_at) < self.ttl)
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new(nimbus_core::keys::SUBSCRIPTION_TTL)
    }
}

#[async_trait]
impl SubscriptionTracker for MemoryTracker {
    async fn increment(&self, scope: &ScopeKey) -> SyncResult<u64> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        let expired = counters
            .get(scope)
            .is_some_and(|c| !self.live(c, now));
        if expired {
            counters.remove(scope);
        }

        let counter = counters.entry(scope.clone()).or_insert(Counter {
            count: 0,
            refreshed_at: now,
        });
        counter.count += 1;
        counter.refreshed_at = now;
        Ok(counter.count)
    }

    async fn decrement(&self, scope: &ScopeKey) -> SyncResult<u64> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        let remaining = match counters.get_mut(scope) {
            Some(counter) if self.live(counter, now) => {
                counter.count -= 1;
                counter.count
            }
            _ => 0,
        };
        if remaining == 0 {
            counters.remove(scope);
        }
        Ok(remaining)
    }

    async fn snapshot_counts(&self) -> SyncResult<HashMap<ScopeKey, u64>> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        counters.retain(|_, c| self.live(c, now));
        Ok(counters
            .iter()
            .map(|(scope, c)| (scope.clone(), c.count))
            .collect())
    }
}
