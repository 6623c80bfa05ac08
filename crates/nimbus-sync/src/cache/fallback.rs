//! Primary/secondary cache facade.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::keys::HEALTH_PROBE_KEY;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::CacheStore;
use crate::error::{SyncError, SyncResult};

#[derive(Debug)]
struct PrimaryHealth {
    healthy: bool,
    last_probe: Option<Instant>,
}

/// Serves every call from the primary tier while it answers its health
/// probe, and from the secondary tier otherwise.
///
/// Writes through a healthy primary are mirrored to the secondary, so a
/// later outage still finds recent snapshots. Only a failure of both tiers
/// is reported to the caller.
pub struct FallbackCache {
    primary: Arc<dyn CacheStore>,
    secondary: Arc<dyn CacheStore>,
    health: RwLock<PrimaryHealth>,
    probe_retry: Duration,
}

impl FallbackCache {
    pub fn new(
        primary: Arc<dyn CacheStore>,
        secondary: Arc<dyn CacheStore>,
        probe_retry: Duration,
    ) -> Self {
        FallbackCache {
            primary,
            secondary,
            health: RwLock::new(PrimaryHealth {
                healthy: true,
                last_probe: None,
            }),
            probe_retry,
        }
    }

    /// Whether the last probe found the primary reachable.
    pub async fn primary_healthy(&self) -> bool {
        self.health.read().await.healthy
    }

    /// Probes the primary, rate limited while it is unhealthy.
    async fn primary_available(&self) -> bool {
        {
            let health = self.health.read().await;
            if !health.healthy {
                if let Some(last) = health.last_probe {
                    if last.elapsed() < self.probe_retry {
                        return false;
                    }
                }
            }
        }

        match self.primary.exists(HEALTH_PROBE_KEY).await {
            Ok(_) => {
                self.mark_healthy().await;
                true
            }
            Err(e) => {
                self.mark_unhealthy(&e).await;
                false
            }
        }
    }

    async fn mark_healthy(&self) {
        let mut health = self.health.write().await;
        if !health.healthy {
            info!(primary = self.primary.name(), "Primary cache recovered");
        }
        health.healthy = true;
        health.last_probe = Some(Instant::now());
    }

    async fn mark_unhealthy(&self, err: &SyncError) {
        let mut health = self.health.write().await;
        if health.healthy {
            warn!(
                primary = self.primary.name(),
                secondary = self.secondary.name(),
                error = %err,
                "Primary cache unavailable, falling back to secondary"
            );
        }
        health.healthy = false;
        health.last_probe = Some(Instant::now());
    }

    fn unavailable(primary: impl ToString, secondary: SyncError) -> SyncError {
        SyncError::CacheUnavailable {
            primary: primary.to_string(),
            secondary: secondary.to_string(),
        }
    }
}

const PRIMARY_DOWN: &str = "primary marked unhealthy";

#[async_trait]
impl CacheStore for FallbackCache {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        if self.primary_available().await {
            match self.primary.get(key).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    self.mark_unhealthy(&e).await;
                    return self
                        .secondary
                        .get(key)
                        .await
                        .map_err(|e2| Self::unavailable(e, e2));
                }
            }
        }
        self.secondary
            .get(key)
            .await
            .map_err(|e| Self::unavailable(PRIMARY_DOWN, e))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> SyncResult<()> {
        if self.primary_available().await {
            match self.primary.set(key, value, ttl).await {
                Ok(()) => {
                    if let Err(e) = self.secondary.set(key, value, ttl).await {
                        debug!(key, error = %e, "Secondary mirror write failed");
                    }
                    return Ok(());
                }
                Err(e) => {
                    self.mark_unhealthy(&e).await;
                    return self
                        .secondary
                        .set(key, value, ttl)
                        .await
                        .map_err(|e2| Self::unavailable(e, e2));
                }
            }
        }
        self.secondary
            .set(key, value, ttl)
            .await
            .map_err(|e| Self::unavailable(PRIMARY_DOWN, e))
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        let primary_result = if self.primary_available().await {
            let result = self.primary.delete(key).await;
            if let Err(ref e) = result {
                self.mark_unhealthy(e).await;
            }
            Some(result)
        } else {
            None
        };

        match (primary_result, self.secondary.delete(key).await) {
            (Some(Ok(())), _) | (_, Ok(())) => Ok(()),
            (Some(Err(p)), Err(s)) => Err(Self::unavailable(p, s)),
            (None, Err(s)) => Err(Self::unavailable(PRIMARY_DOWN, s)),
        }
    }

    async fn exists(&self, key: &str) -> SyncResult<bool> {
        if self.primary_available().await {
            match self.primary.exists(key).await {
                Ok(found) => return Ok(found),
                Err(e) => {
                    self.mark_unhealthy(&e).await;
                    return self
                        .secondary
                        .exists(key)
                        .await
                        .map_err(|e2| Self::unavailable(e, e2));
                }
            }
        }
        self.secondary
            .exists(key)
            .await
            .map_err(|e| Self::unavailable(PRIMARY_DOWN, e))
    }

    async fn close(&self) -> SyncResult<()> {
        let primary = self.primary.close().await;
        let secondary = self.secondary.close().await;
        primary.and(secondary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::cache::MemoryCache;

    /// Memory tier that can be switched off, or made to fail only on data
    /// calls while still answering the health probe.
    struct FlakyCache {
        inner: MemoryCache,
        down: AtomicBool,
        data_calls_fail: AtomicBool,
    }

    impl FlakyCache {
        fn new() -> Arc<Self> {
            Arc::new(FlakyCache {
                inner: MemoryCache::new(100),
                down: AtomicBool::new(false),
                data_calls_fail: AtomicBool::new(false),
            })
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self, data_call: bool) -> SyncResult<()> {
            if self.down.load(Ordering::SeqCst)
                || (data_call && self.data_calls_fail.load(Ordering::SeqCst))
            {
                return Err(SyncError::CacheBackend("connection refused".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CacheStore for FlakyCache {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
            self.check(true)?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> SyncResult<()> {
            self.check(true)?;
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> SyncResult<()> {
            self.check(true)?;
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> SyncResult<bool> {
            self.check(key != HEALTH_PROBE_KEY)?;
            self.inner.exists(key).await
        }
    }

    fn setup() -> (Arc<FlakyCache>, Arc<FlakyCache>, FallbackCache) {
        let primary = FlakyCache::new();
        let secondary = FlakyCache::new();
        let cache = FallbackCache::new(
            primary.clone(),
            secondary.clone(),
            Duration::from_secs(5),
        );
        (primary, secondary, cache)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_healthy_primary_serves_and_mirrors() {
        let (primary, secondary, cache) = setup();

        cache.set("k", b"v", TTL).await.unwrap();
        assert_eq!(primary.inner.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(secondary.inner.get("k").await.unwrap(), Some(b"v".to_vec()));

        // A primary miss is authoritative while healthy.
        secondary.inner.set("only-secondary", b"x", TTL).await.unwrap();
        assert_eq!(cache.get("only-secondary").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mirror_failure_is_swallowed() {
        let (primary, secondary, cache) = setup();
        secondary.set_down(true);

        cache.set("k", b"v", TTL).await.unwrap();
        assert!(primary.inner.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_falls_back_when_primary_down() {
        let (primary, secondary, cache) = setup();
        cache.set("k", b"v1", TTL).await.unwrap();

        primary.set_down(true);
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v1".to_vec()));
        assert!(!cache.primary_healthy().await);

        cache.set("k", b"v2", TTL).await.unwrap();
        assert_eq!(secondary.inner.get("k").await.unwrap(), Some(b"v2".to_vec()));
        assert!(cache.exists("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_reprobed_after_retry_interval() {
        let (primary, _secondary, cache) = setup();

        primary.set_down(true);
        cache.set("k", b"fallback", TTL).await.unwrap();
        primary.set_down(false);

        // Still within probe_retry: the recovered primary is not consulted.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k").await.unwrap(), Some(b"fallback".to_vec()));
        assert!(!cache.primary_healthy().await);

        tokio::time::advance(Duration::from_secs(4)).await;
        cache.set("k", b"primary", TTL).await.unwrap();
        assert!(cache.primary_healthy().await);
        assert_eq!(primary.inner.get("k").await.unwrap(), Some(b"primary".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_down_at_start_is_picked_up_later() {
        let (primary, secondary, cache) = setup();
        primary.set_down(true);

        cache.set("boot", b"memory", TTL).await.unwrap();
        assert!(!cache.primary_healthy().await);
        assert_eq!(secondary.inner.get("boot").await.unwrap(), Some(b"memory".to_vec()));
        assert_eq!(cache.get("boot").await.unwrap(), Some(b"memory".to_vec()));

        primary.set_down(false);
        tokio::time::advance(Duration::from_secs(6)).await;

        cache.set("later", b"shared", TTL).await.unwrap();
        assert!(cache.primary_healthy().await);
        assert_eq!(primary.inner.get("later").await.unwrap(), Some(b"shared".to_vec()));
    }

    enum Op {
        Set(&'static str, &'static [u8]),
        Get(&'static str),
        Delete(&'static str),
        Exists(&'static str),
    }

    async fn apply(cache: &dyn CacheStore, op: &Op) -> String {
        match op {
            Op::Set(key, value) => format!("{:?}", cache.set(key, value, TTL).await.map_err(|e| e.to_string())),
            Op::Get(key) => format!("{:?}", cache.get(key).await.map_err(|e| e.to_string())),
            Op::Delete(key) => format!("{:?}", cache.delete(key).await.map_err(|e| e.to_string())),
            Op::Exists(key) => format!("{:?}", cache.exists(key).await.map_err(|e| e.to_string())),
        }
    }

    #[tokio::test]
    async fn test_primary_down_behaves_like_secondary_alone() {
        let (primary, _secondary, cache) = setup();
        primary.set_down(true);
        let alone = MemoryCache::new(100);

        let ops = [
            Op::Get("a"),
            Op::Set("a", b"1"),
            Op::Get("a"),
            Op::Exists("a"),
            Op::Set("a", b"2"),
            Op::Set("b", b"x"),
            Op::Get("a"),
            Op::Delete("a"),
            Op::Get("a"),
            Op::Exists("a"),
            Op::Delete("missing"),
            Op::Get("b"),
        ];
        for op in &ops {
            assert_eq!(apply(&cache, op).await, apply(&alone, op).await);
        }
        assert!(primary.inner.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_operation_error_despite_probe_uses_secondary() {
        let (primary, secondary, cache) = setup();
        secondary.inner.set("k", b"backup", TTL).await.unwrap();
        primary.data_calls_fail.store(true, Ordering::SeqCst);

        assert_eq!(cache.get("k").await.unwrap(), Some(b"backup".to_vec()));
        assert!(!cache.primary_healthy().await);
    }

    #[tokio::test]
    async fn test_both_tiers_down() {
        let (primary, secondary, cache) = setup();
        primary.set_down(true);
        secondary.set_down(true);

        let err = cache.get("k").await.unwrap_err();
        assert!(matches!(err, SyncError::CacheUnavailable { .. }));
        assert!(cache.set("k", b"v", TTL).await.is_err());
        assert!(cache.delete("k").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_succeeds_if_any_tier_does() {
        let (primary, secondary, cache) = setup();
        cache.set("k", b"v", TTL).await.unwrap();

        secondary.set_down(true);
        cache.delete("k").await.unwrap();
        assert!(!primary.inner.exists("k").await.unwrap());
    }
}
