//! # Subscription Tracker
//!
//! Counts live subscribers per scope. The counts are the only demand signal
//! the scheduler consults when it assigns priority tiers.
//!
//! ```text
//! hub subscribe(scope)   ──► increment ──► subscriptions:aws:cred-a:us-east-1 = 3
//! hub unsubscribe(scope) ──► decrement ──► ... = 2   (deleted at 0)
//! scheduler tick         ──► snapshot_counts ──► {scope → 2, ...}
//! ```
//!
//! Counters are shared across server instances when backed by Redis and
//! expire on their own if a process dies without decrementing.

mod memory;
mod redis;

pub use self::memory::MemoryTracker;
pub use self::redis::RedisTracker;

use std::collections::HashMap;

use async_trait::async_trait;
use nimbus_core::ScopeKey;

use crate::error::SyncResult;

#[async_trait]
pub trait SubscriptionTracker: Send + Sync {
    /// Adds one subscriber and refreshes the counter's TTL. Returns the new
    /// count.
    async fn increment(&self, scope: &ScopeKey) -> SyncResult<u64>;

    /// Removes one subscriber. Never goes below zero; the counter is
    /// deleted when it reaches zero.
    async fn decrement(&self, scope: &ScopeKey) -> SyncResult<u64>;

    /// Current positive counts for every tracked scope.
    async fn snapshot_counts(&self) -> SyncResult<HashMap<ScopeKey, u64>>;
}
