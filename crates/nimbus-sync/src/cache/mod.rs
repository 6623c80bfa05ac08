//! # Snapshot Cache
//!
//! Key/value storage for serialized resource snapshots.
//!
//! ## Tiers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          FallbackCache                                  │
//! │                                                                         │
//! │   every call ──► EXISTS health_check on primary                        │
//! │                     │                                                   │
//! │          healthy ───┴─── unhealthy (re-probed every probe_retry)       │
//! │             │                     │                                     │
//! │   ┌─────────▼────────┐   ┌────────▼─────────┐                          │
//! │   │ RedisCache       │   │ MemoryCache      │                          │
//! │   │ (shared, primary)│──►│ (per process)    │  writes mirrored          │
//! │   └──────────────────┘   └──────────────────┘  best effort             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Callers only ever hold an `Arc<dyn CacheStore>`; which tier served a call
//! is invisible to them.

mod fallback;
mod memory;
mod redis;

pub use self::fallback::FallbackCache;
pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SyncResult;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Tier name used in logs.
    fn name(&self) -> &'static str;

    /// Returns the stored value, or `None` on a miss or after expiry.
    async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`. A zero `ttl` never expires.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> SyncResult<()>;

    async fn delete(&self, key: &str) -> SyncResult<()>;

    async fn exists(&self, key: &str) -> SyncResult<bool>;

    /// Releases backend resources. Further calls may fail.
    async fn close(&self) -> SyncResult<()> {
        Ok(())
    }
}
