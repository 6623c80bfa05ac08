//! # Sync Configuration
//!
//! Configuration management for the sync engine and the fan-out hub.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     NIMBUS_REDIS_URL=redis://cache:6379                                │
//! │     NIMBUS_HUB_PORT=8080                                               │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/nimbus-sync/sync.toml (Linux)                            │
//! │     ~/Library/Application Support/io.nimbus.nimbus-sync/sync.toml     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     In-memory cache and tracker, 60s/180s/600s tiers                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [redis]
//! url = "redis://127.0.0.1:6379"
//!
//! [cache.ttl_secs]
//! instance = 15
//!
//! [scheduler]
//! kinds = ["vpc", "instance"]
//! high_interval_secs = 60
//! medium_interval_secs = 180
//! low_interval_secs = 600
//!
//! [hub]
//! port = 8080
//!
//! [providers.aws]
//! regions = ["us-east-1"]
//! fixture_dir = "/var/lib/nimbus/fixtures/aws"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use nimbus_core::{PriorityTier, RegionTable, ResourceKind, TierThresholds};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::directory::MemoryDirectory;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Redis Settings
// =============================================================================

/// Shared Redis connection used by the cache, the tracker and the bus.
///
/// Leaving `url` unset runs everything in-process: memory cache only,
/// memory tracker, local bus. That is only correct for a single instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Connection URL (`redis://` or `rediss://`).
    #[serde(default)]
    pub url: Option<String>,

    /// Lifetime of a subscription counter after its last increment.
    #[serde(default = "default_subscription_ttl")]
    pub subscription_ttl_secs: u64,

    /// Prefix of the pub/sub channels events travel on.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
}

fn default_subscription_ttl() -> u64 {
    nimbus_core::keys::SUBSCRIPTION_TTL.as_secs()
}

fn default_channel_prefix() -> String {
    "nimbus:events".to_string()
}

impl Default for RedisSettings {
    fn default() -> Self {
        RedisSettings {
            url: None,
            subscription_ttl_secs: default_subscription_ttl(),
            channel_prefix: default_channel_prefix(),
        }
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Bound on the in-process secondary tier.
    #[serde(default = "default_memory_max_entries")]
    pub memory_max_entries: usize,

    /// Minimum gap between primary probes while it is unhealthy.
    #[serde(default = "default_probe_retry")]
    pub probe_retry_secs: u64,

    /// Per-kind snapshot TTL overrides, keyed by kind name. Zero disables
    /// expiry.
    #[serde(default)]
    pub ttl_secs: BTreeMap<String, u64>,
}

fn default_memory_max_entries() -> usize {
    10_000
}

fn default_probe_retry() -> u64 {
    5
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            memory_max_entries: default_memory_max_entries(),
            probe_retry_secs: default_probe_retry(),
            ttl_secs: BTreeMap::new(),
        }
    }
}

impl CacheSettings {
    /// Snapshot TTL for `kind`, honouring overrides.
    pub fn ttl_for(&self, kind: ResourceKind) -> Duration {
        self.ttl_secs
            .get(kind.as_str())
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| kind.default_ttl())
    }

    pub fn probe_retry(&self) -> Duration {
        Duration::from_secs(self.probe_retry_secs)
    }
}

// =============================================================================
// Scheduler Settings
// =============================================================================

/// Tier loop timing and fan-out limits.
///
/// ## Tier Timing
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  HIGH    ≥ high_threshold watchers     every high_interval_secs  (60s) │
/// │  MEDIUM  ≥ medium_threshold watchers   every medium_interval_secs(180s)│
/// │  LOW     everything else               every low_interval_secs  (600s) │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Resource kinds to keep in sync. One scheduler runs per kind.
    #[serde(default = "default_kinds")]
    pub kinds: Vec<ResourceKind>,

    #[serde(default = "default_high_interval")]
    pub high_interval_secs: u64,

    #[serde(default = "default_medium_interval")]
    pub medium_interval_secs: u64,

    #[serde(default = "default_low_interval")]
    pub low_interval_secs: u64,

    #[serde(default = "default_high_threshold")]
    pub high_threshold: u64,

    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: u64,

    /// Concurrent provider calls per tier.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_page_size")]
    pub workspace_page_size: usize,

    /// Run a full Low pass immediately at start.
    #[serde(default = "default_true")]
    pub initial_sweep: bool,
}

fn default_kinds() -> Vec<ResourceKind> {
    vec![ResourceKind::Vpc]
}

fn default_high_interval() -> u64 {
    60
}

fn default_medium_interval() -> u64 {
    180
}

fn default_low_interval() -> u64 {
    600
}

fn default_high_threshold() -> u64 {
    5
}

fn default_medium_threshold() -> u64 {
    1
}

fn default_max_concurrency() -> usize {
    5
}

fn default_page_size() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            kinds: default_kinds(),
            high_interval_secs: default_high_interval(),
            medium_interval_secs: default_medium_interval(),
            low_interval_secs: default_low_interval(),
            high_threshold: default_high_threshold(),
            medium_threshold: default_medium_threshold(),
            max_concurrency: default_max_concurrency(),
            workspace_page_size: default_page_size(),
            initial_sweep: true,
        }
    }
}

impl SchedulerConfig {
    /// Loop interval of a tier.
    pub fn interval(&self, tier: PriorityTier) -> Duration {
        let secs = match tier {
            PriorityTier::High => self.high_interval_secs,
            PriorityTier::Medium => self.medium_interval_secs,
            PriorityTier::Low => self.low_interval_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn thresholds(&self) -> TierThresholds {
        TierThresholds {
            high: self.high_threshold,
            medium: self.medium_threshold,
        }
    }
}

// =============================================================================
// Hub Settings
// =============================================================================

/// Real-time endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Bind address (default: 0.0.0.0 for all interfaces).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_hub_port")]
    pub port: u16,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Connections silent for longer than this are evicted.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Frames buffered per client before events are dropped for it.
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,

    /// Capacity of the in-process broadcast channel.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// Recent events kept per user for replay on reconnect. 0 disables replay.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_history_ttl")]
    pub history_ttl_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_hub_port() -> u16 {
    8080
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_reap_interval() -> u64 {
    30
}

fn default_client_buffer() -> usize {
    64
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_history_capacity() -> usize {
    1000
}

fn default_history_ttl() -> u64 {
    3600
}

impl Default for HubSettings {
    fn default() -> Self {
        HubSettings {
            bind_addr: default_bind_addr(),
            port: default_hub_port(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
            client_buffer: default_client_buffer(),
            bus_capacity: default_bus_capacity(),
            history_capacity: default_history_capacity(),
            history_ttl_secs: default_history_ttl(),
        }
    }
}

impl HubSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs)
    }
}

// =============================================================================
// Provider Settings
// =============================================================================

/// One `[providers.<name>]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Replaces the built-in default region list for the Low sweep.
    #[serde(default)]
    pub regions: Vec<String>,

    /// Directory of recorded snapshots served by the fixture client.
    #[serde(default)]
    pub fixture_dir: Option<PathBuf>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        ProviderSettings {
            enabled: true,
            regions: Vec::new(),
            fixture_dir: None,
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub redis: RedisSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub hub: HubSettings,

    /// Provider name → settings.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,

    /// Static directory used when no database is configured.
    #[serde(default)]
    pub directory: MemoryDirectory,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let s = &self.scheduler;

        if s.high_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "high_interval_secs must be greater than 0".into(),
            ));
        }
        if !(s.high_interval_secs < s.medium_interval_secs
            && s.medium_interval_secs < s.low_interval_secs)
        {
            return Err(SyncError::InvalidConfig(format!(
                "tier intervals must increase high < medium < low, got {}/{}/{}",
                s.high_interval_secs, s.medium_interval_secs, s.low_interval_secs
            )));
        }

        s.thresholds()
            .validate()
            .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        if s.max_concurrency == 0 {
            return Err(SyncError::InvalidConfig(
                "max_concurrency must be greater than 0".into(),
            ));
        }
        if s.workspace_page_size == 0 {
            return Err(SyncError::InvalidConfig(
                "workspace_page_size must be greater than 0".into(),
            ));
        }
        if s.kinds.is_empty() {
            return Err(SyncError::InvalidConfig(
                "scheduler.kinds must name at least one resource kind".into(),
            ));
        }

        for kind in self.cache.ttl_secs.keys() {
            kind.parse::<ResourceKind>()
                .map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        }

        if let Some(ref raw) = self.redis.url {
            let parsed = url::Url::parse(raw)?;
            if parsed.scheme() != "redis" && parsed.scheme() != "rediss" {
                return Err(SyncError::InvalidUrl(format!(
                    "Redis URL must start with redis:// or rediss://, got: {}",
                    raw
                )));
            }
        }

        let hub = &self.hub;
        if hub.heartbeat_interval_secs == 0 || hub.reap_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "hub heartbeat and reap intervals must be greater than 0".into(),
            ));
        }
        if hub.idle_timeout_secs <= hub.heartbeat_interval_secs {
            return Err(SyncError::InvalidConfig(format!(
                "idle_timeout_secs ({}) must exceed heartbeat_interval_secs ({})",
                hub.idle_timeout_secs, hub.heartbeat_interval_secs
            )));
        }
        if hub.client_buffer == 0 || hub.bus_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "client_buffer and bus_capacity must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("NIMBUS_REDIS_URL") {
            debug!("Overriding Redis URL from environment");
            self.redis.url = Some(url);
        }

        if let Ok(addr) = std::env::var("NIMBUS_HUB_BIND_ADDR") {
            self.hub.bind_addr = addr;
        }

        if let Ok(port) = std::env::var("NIMBUS_HUB_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                debug!(port = p, "Overriding hub port from environment");
                self.hub.port = p;
            }
        }

        if let Ok(value) = std::env::var("NIMBUS_MAX_CONCURRENCY") {
            match value.parse::<usize>() {
                Ok(n) => self.scheduler.max_concurrency = n,
                Err(_) => warn!(value = %value, "Ignoring invalid NIMBUS_MAX_CONCURRENCY"),
            }
        }

        let intervals = [
            ("NIMBUS_HIGH_INTERVAL_SECS", &mut self.scheduler.high_interval_secs),
            ("NIMBUS_MEDIUM_INTERVAL_SECS", &mut self.scheduler.medium_interval_secs),
            ("NIMBUS_LOW_INTERVAL_SECS", &mut self.scheduler.low_interval_secs),
        ];
        for (var, slot) in intervals {
            if let Ok(value) = std::env::var(var) {
                match value.parse::<u64>() {
                    Ok(secs) => *slot = secs,
                    Err(_) => warn!(var, value = %value, "Ignoring invalid interval override"),
                }
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "nimbus", "nimbus-sync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Built-in regions with the `[providers.*] regions` overrides applied.
    pub fn region_table(&self) -> RegionTable {
        self.providers
            .iter()
            .fold(RegionTable::new(), |table, (name, settings)| {
                table.with(name.clone(), settings.regions.clone())
            })
    }

    /// Returns the Redis URL if configured.
    pub fn redis_url(&self) -> Option<&str> {
        self.redis.url.as_deref()
    }

    pub fn subscription_ttl(&self) -> Duration {
        Duration::from_secs(self.redis.subscription_ttl_secs)
    }
}
