//! # nimbus-sync: Resource Sync Engine and Real-time Fan-out
//!
//! Keeps cached snapshots of cloud resources in step with the providers,
//! turns every refresh into change events, and streams those events to the
//! dashboard clients that asked for them.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Nimbus Sync Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncScheduler (one per resource kind)            │  │
//! │  │                                                                  │  │
//! │  │  HIGH / MEDIUM / LOW tier loops share one SyncWorker             │  │
//! │  │  Demand comes from the SubscriptionTracker                       │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │ per scope                               │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ ProviderClient │  │ FallbackCache  │  │  nimbus_core::diff     │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Registry keyed │  │ Redis primary  │  │ Created / Updated /    │    │
//! │  │ by provider    │  │ memory backup  │  │ Deleted + Listed       │    │
//! │  └────────────────┘  └────────────────┘  └───────────┬────────────┘    │
//! │                                                      │ publish          │
//! │  ┌───────────────────────────────────────────────────▼─────────────┐   │
//! │  │           EventBus (LocalBus / RedisBus across instances)       │   │
//! │  └───────────────────────────────────────────────────┬─────────────┘   │
//! │                                                      │ pattern "*"      │
//! │  ┌───────────────────────────────────────────────────▼─────────────┐   │
//! │  │  Hub actor: per-connection gates, heartbeat, idle reaper        │   │
//! │  │  HubServer: GET /events (SSE) + subscription control routes     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  Concrete scope subscriptions flow back into the tracker, which        │
//! │  decides the tier of each scope on the next pass.                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`cache`] - Cache tiers and the fallback wrapper
//! - [`tracker`] - Subscriber counters per scope
//! - [`bus`] - Topic publish/subscribe
//! - [`provider`] - Provider clients and their registry
//! - [`directory`] - Workspace and credential lookups
//! - [`scheduler`] - Priority tier loops and the sync worker
//! - [`hub`] - Fan-out actor and its HTTP surface
//! - [`connector`] - Lazily connected Redis shared by cache, tracker and bus
//! - [`config`] - TOML configuration with env overrides
//! - [`error`] - Error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nimbus_sync::{Hub, HubConfig, LocalBus, MemoryTracker, SyncConfig};
//!
//! let config = SyncConfig::load(None)?;
//! let bus = Arc::new(LocalBus::new(config.hub.bus_capacity));
//! let tracker = Arc::new(MemoryTracker::new(config.subscription_ttl()));
//!
//! let (hub, _task) = Hub::new(HubConfig::from_settings(&config.hub), bus, tracker).start();
//! let stats = hub.stats().await?;
//! println!("Connections: {}", stats.connections);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod bus;
pub mod cache;
pub mod config;
pub mod connector;
pub mod directory;
pub mod error;
pub mod hub;
pub mod provider;
pub mod scheduler;
pub mod tracker;

// =============================================================================
// Re-exports
// =============================================================================

pub use bus::{BusMessage, EventBus, LocalBus, RedisBus, Subscription, TopicPattern};
pub use cache::{CacheStore, FallbackCache, MemoryCache, RedisCache};
pub use connector::RedisConnector;
pub use config::{
    CacheSettings, HubSettings, ProviderSettings, RedisSettings, SchedulerConfig, SyncConfig,
};
pub use directory::{Credential, CredentialStore, MemoryDirectory, Workspace, WorkspaceStore};
pub use error::{SyncError, SyncResult};
pub use hub::{
    ConnectionGrant, ConnectionId, ConnectionInfo, Hub, HubConfig, HubHandle, HubServer,
    HubStats, ScopeFilter, SubscriptionTarget,
};
pub use provider::{
    fixture_factory, FixtureProvider, ProviderClient, ProviderError, ProviderFactory,
    ProviderRegistry,
};
pub use scheduler::{PassReport, SchedulerHandle, SchedulerSettings, SyncScheduler, SyncWorker};
pub use tracker::{MemoryTracker, RedisTracker, SubscriptionTracker};
