//! # Nimbus Sync Server
//!
//! Runs the sync schedulers, the fan-out hub and its HTTP endpoint.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Sync Server                                    │
//! │                                                                         │
//! │  SyncScheduler (per kind) ──► FallbackCache ──► EventBus ──► Hub       │
//! │          │                     (Redis/memory)                 │         │
//! │          ▼                                                    ▼         │
//! │   PostgreSQL directory                        HTTP :8080 (SSE clients)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use anyhow::Context;
use nimbus_server::{PgDirectory, ServerConfig};
use nimbus_sync::{
    fixture_factory, CacheStore, CredentialStore, EventBus, FallbackCache, Hub, HubConfig,
    HubServer, LocalBus, MemoryCache, MemoryTracker, ProviderRegistry, RedisBus, RedisCache,
    RedisConnector, RedisTracker, SchedulerSettings, SubscriptionTracker, SyncConfig,
    SyncScheduler, SyncWorker, WorkspaceStore,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Storage and messaging shared by every scheduler and the hub.
struct Backends {
    cache: Arc<dyn CacheStore>,
    tracker: Arc<dyn SubscriptionTracker>,
    bus: Arc<dyn EventBus>,
    listener: Option<JoinHandle<()>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nimbus_sync=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting Nimbus sync server...");

    // Load configuration
    let server_config = ServerConfig::load()?;
    let config = SyncConfig::load(server_config.config_path.clone())
        .context("failed to load sync configuration")?;
    info!(
        kinds = ?config.scheduler.kinds,
        port = config.hub.port,
        redis = config.redis_url().is_some(),
        database = server_config.database_url.is_some(),
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let backends = connect_backends(&config, shutdown.clone()).await?;

    // Directory
    let (workspaces, credentials): (Arc<dyn WorkspaceStore>, Arc<dyn CredentialStore>) =
        match &server_config.database_url {
            Some(url) => {
                let db = Arc::new(
                    PgDirectory::connect(url, server_config.database_max_connections).await?,
                );
                (db.clone() as Arc<dyn WorkspaceStore>, db as Arc<dyn CredentialStore>)
            }
            None => {
                if config.directory.is_empty() {
                    warn!("No database and no static workspaces configured; nothing will sync");
                }
                let dir = Arc::new(config.directory.clone());
                (dir.clone() as Arc<dyn WorkspaceStore>, dir as Arc<dyn CredentialStore>)
            }
        };

    // Providers
    let registry = ProviderRegistry::from_settings(&config.providers, fixture_factory)?;
    if registry.is_empty() {
        warn!("No provider clients registered");
    }
    info!(providers = ?registry.providers(), "Provider registry ready");

    // Schedulers, one per resource kind
    let mut schedulers = Vec::new();
    for kind in &config.scheduler.kinds {
        let worker = SyncWorker::builder()
            .workspaces(workspaces.clone())
            .credentials(credentials.clone())
            .providers(registry.clone())
            .cache(backends.cache.clone())
            .tracker(backends.tracker.clone())
            .bus(backends.bus.clone())
            .settings(SchedulerSettings::from_config(&config, *kind))
            .build()?;
        schedulers.push(SyncScheduler::new(worker).start_with_token(shutdown.child_token()));
    }

    // Fan-out hub and HTTP endpoint
    let (hub, hub_task) = Hub::new(
        HubConfig::from_settings(&config.hub).with_regions(config.region_table()),
        backends.bus.clone(),
        backends.tracker.clone(),
    )
    .start_with_token(shutdown.child_token());
    let (addr, server_task) = HubServer::new(&config.hub, hub)
        .start(shutdown.clone())
        .await?;
    info!(%addr, "Accepting real-time clients");

    shutdown_signal().await;
    shutdown.cancel();

    for scheduler in schedulers {
        scheduler.shutdown().await;
    }
    let _ = hub_task.await;
    let _ = server_task.await;
    if let Some(listener) = backends.listener {
        let _ = listener.await;
    }
    if let Err(e) = backends.cache.close().await {
        warn!(?e, "Cache close failed");
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Builds Redis-backed components, or in-memory ones when no Redis is
/// configured.
///
/// A configured Redis that is down at boot does not change the wiring: the
/// cache serves from memory until its probe finds Redis again, the tracker
/// and the publisher connect on first use, and the listener retries with
/// backoff.
async fn connect_backends(
    config: &SyncConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<Backends> {
    let memory_cache = Arc::new(MemoryCache::new(config.cache.memory_max_entries));

    let Some(url) = config.redis_url() else {
        info!("No Redis configured, running in single-instance mode");
        return Ok(Backends {
            cache: memory_cache,
            tracker: Arc::new(MemoryTracker::new(config.subscription_ttl())),
            bus: Arc::new(LocalBus::new(config.hub.bus_capacity)),
            listener: None,
        });
    };

    let redis = RedisConnector::open(url).context("invalid Redis URL")?;
    if let Err(e) = redis.connection().await {
        warn!(error = %e, "Redis unreachable at startup, serving from memory until it recovers");
    }

    let cache = FallbackCache::new(
        Arc::new(RedisCache::new(redis.clone())),
        memory_cache,
        config.cache.probe_retry(),
    );
    let tracker = RedisTracker::new(redis.clone(), config.subscription_ttl());
    let (bus, listener) = RedisBus::start(
        redis,
        config.redis.channel_prefix.clone(),
        config.hub.bus_capacity,
        shutdown,
    );

    Ok(Backends {
        cache: Arc::new(cache),
        tracker: Arc::new(tracker),
        bus: Arc::new(bus),
        listener: Some(listener),
    })
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
