//! # Sync Worker
//!
//! One tier pass: read demand, enumerate scopes, refresh the ones that are
//! due, publish what changed.
//!
//! ## Per-scope Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  cache.get(vpc:aws:cred:region) ──► previous (corrupt → none)          │
//! │                 │                                                       │
//! │  provider.list_resources ──► current                                   │
//! │                 │                                                       │
//! │  diff(previous, current) ──► deltas (only if previous existed)         │
//! │                 │                                                       │
//! │  cache.set(current, ttl)   ── failure aborts, nothing published        │
//! │                 │                                                       │
//! │  bus: vpc.listed, then vpc.created / vpc.deleted / vpc.updated         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nimbus_core::keys::snapshot_key;
use nimbus_core::{
    diff, ChangeCounts, ChangeEvent, PriorityTier, RegionTable, ResourceKind, ResourceSnapshot,
    ScopeKey, TierThresholds,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::cache::CacheStore;
use crate::config::SyncConfig;
use crate::directory::{Credential, CredentialStore, WorkspaceStore};
use crate::error::{SyncError, SyncResult};
use crate::provider::ProviderRegistry;
use crate::tracker::SubscriptionTracker;

/// Fraction of a tier interval a scope must have aged before it is synced
/// again. Absorbs timer jitter between loops.
const FRESHNESS_TOLERANCE: f64 = 0.9;

// =============================================================================
// Settings
// =============================================================================

/// Per-kind scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub kind: ResourceKind,
    pub high_interval: Duration,
    pub medium_interval: Duration,
    pub low_interval: Duration,
    pub thresholds: TierThresholds,
    pub max_concurrency: usize,
    pub page_size: usize,
    /// Snapshot TTL in the cache.
    pub ttl: Duration,
    /// Low sweep regions, and the regions a tracked scope may name.
    pub regions: RegionTable,
    pub initial_sweep: bool,
}

impl SchedulerSettings {
    pub fn from_config(config: &SyncConfig, kind: ResourceKind) -> Self {
        let s = &config.scheduler;
        SchedulerSettings {
            kind,
            high_interval: s.interval(PriorityTier::High),
            medium_interval: s.interval(PriorityTier::Medium),
            low_interval: s.interval(PriorityTier::Low),
            thresholds: s.thresholds(),
            max_concurrency: s.max_concurrency,
            page_size: s.workspace_page_size,
            ttl: config.cache.ttl_for(kind),
            regions: config.region_table(),
            initial_sweep: s.initial_sweep,
        }
    }

    pub fn interval(&self, tier: PriorityTier) -> Duration {
        match tier {
            PriorityTier::High => self.high_interval,
            PriorityTier::Medium => self.medium_interval,
            PriorityTier::Low => self.low_interval,
        }
    }

    pub fn regions_for(&self, provider: &str) -> Vec<String> {
        self.regions.sweep_regions(provider)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default(), ResourceKind::Vpc)
    }
}

// =============================================================================
// Pass Report
// =============================================================================

/// Outcome of one tier pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub tier: PriorityTier,
    pub kind: ResourceKind,
    /// Scopes enumerated for this tier.
    pub candidates: usize,
    /// Candidates skipped as fresh or already in flight.
    pub skipped: usize,
    pub synced: usize,
    pub failed: usize,
    pub changes: ChangeCounts,
    pub elapsed: Duration,
}

impl PassReport {
    fn new(tier: PriorityTier, kind: ResourceKind) -> Self {
        PassReport {
            tier,
            kind,
            candidates: 0,
            skipped: 0,
            synced: 0,
            failed: 0,
            changes: ChangeCounts::default(),
            elapsed: Duration::ZERO,
        }
    }
}

// =============================================================================
// Sync Worker
// =============================================================================

struct WorkerInner {
    workspaces: Arc<dyn WorkspaceStore>,
    credentials: Arc<dyn CredentialStore>,
    providers: ProviderRegistry,
    cache: Arc<dyn CacheStore>,
    tracker: Arc<dyn SubscriptionTracker>,
    bus: Arc<dyn EventBus>,
    settings: SchedulerSettings,
    permits: HashMap<PriorityTier, Arc<Semaphore>>,
    /// Last sync per scope, shared by every tier. Also stamped when a
    /// scope fails with an error that retrying will not fix.
    last_synced: Mutex<HashMap<ScopeKey, Instant>>,
    in_flight: Mutex<HashSet<ScopeKey>>,
    tracker_degraded: AtomicBool,
}

/// Refreshes scopes for one resource kind. Cheap to clone.
#[derive(Clone)]
pub struct SyncWorker {
    inner: Arc<WorkerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases a claimed scope even if its task panics.
struct InFlightClaim {
    inner: Arc<WorkerInner>,
    scope: ScopeKey,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        lock(&self.inner.in_flight).remove(&self.scope);
    }
}

impl SyncWorker {
    pub fn builder() -> SyncWorkerBuilder {
        SyncWorkerBuilder::default()
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    pub fn kind(&self) -> ResourceKind {
        self.inner.settings.kind
    }

    /// True while the tracker is unreachable and passes run without demand.
    pub fn tracker_degraded(&self) -> bool {
        self.inner.tracker_degraded.load(Ordering::Relaxed)
    }

    /// Runs one pass for `tier`. Individual scope failures are counted,
    /// never propagated.
    pub async fn run_pass(&self, tier: PriorityTier) -> PassReport {
        let started = Instant::now();
        let mut report = PassReport::new(tier, self.kind());

        let counts = self.demand().await;
        let candidates = self.candidates(tier, &counts).await;
        report.candidates = candidates.len();

        let due = self.claim_due(tier, candidates);
        report.skipped = report.candidates - due.len();

        let semaphore = self
            .inner
            .permits
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| Arc::new(Semaphore::new(self.inner.settings.max_concurrency)));

        let mut tasks = JoinSet::new();
        for (claim, credential) in due {
            let worker = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| SyncError::ShuttingDown)?;
                let scope = claim.scope.clone();
                let result = worker.sync_scope(&scope, &credential).await;
                match result {
                    Err(ref e) if e.is_retryable() => {
                        warn!(scope = %scope, kind = %worker.kind(), error = %e, "Scope sync failed, retrying next tick");
                    }
                    Err(ref e) => {
                        worker.mark_synced(&scope);
                        error!(scope = %scope, kind = %worker.kind(), error = %e, "Scope sync rejected, retrying after a full interval");
                    }
                    Ok(_) => {}
                }
                drop(claim);
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(changes)) => {
                    report.synced += 1;
                    report.changes.add(changes);
                }
                Ok(Err(_)) => report.failed += 1,
                Err(e) => {
                    error!(?e, "Scope sync task panicked");
                    report.failed += 1;
                }
            }
        }

        report.elapsed = started.elapsed();
        if report.candidates > 0 {
            info!(
                tier = %tier,
                kind = %report.kind,
                candidates = report.candidates,
                skipped = report.skipped,
                synced = report.synced,
                failed = report.failed,
                created = report.changes.created,
                updated = report.changes.updated,
                deleted = report.changes.deleted,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Sync pass complete"
            );
        } else {
            debug!(tier = %tier, kind = %report.kind, "Sync pass found no candidates");
        }
        report
    }

    /// Subscriber counts, or an empty map while the tracker is down.
    async fn demand(&self) -> HashMap<ScopeKey, u64> {
        match self.inner.tracker.snapshot_counts().await {
            Ok(counts) => {
                if self.inner.tracker_degraded.swap(false, Ordering::Relaxed) {
                    info!("Subscription tracker recovered");
                }
                counts
            }
            Err(e) => {
                if !self.inner.tracker_degraded.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "Subscription tracker unavailable, syncing without demand data");
                }
                HashMap::new()
            }
        }
    }

    /// Active credentials with a registered provider client, by id.
    async fn active_credentials(&self) -> BTreeMap<String, Credential> {
        let mut active = BTreeMap::new();
        let page_size = self.inner.settings.page_size;
        let mut offset = 0;

        loop {
            let page = match self.inner.workspaces.list_all(page_size, offset).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(offset, error = %e, "Workspace listing failed, pass continues with partial candidates");
                    break;
                }
            };

            for workspace in &page {
                match self
                    .inner
                    .credentials
                    .list_active_by_workspace(&workspace.id)
                    .await
                {
                    Ok(credentials) => {
                        for credential in credentials {
                            if credential.active && self.inner.providers.contains(&credential.provider) {
                                active.insert(credential.id.clone(), credential);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(workspace_id = %workspace.id, error = %e, "Credential listing failed");
                    }
                }
            }

            if page.len() < page_size {
                break;
            }
            offset += page_size;
        }

        active
    }

    /// Scopes belonging to `tier`, sorted.
    async fn candidates(
        &self,
        tier: PriorityTier,
        counts: &HashMap<ScopeKey, u64>,
    ) -> Vec<(ScopeKey, Credential)> {
        let credentials = self.active_credentials().await;
        let mut selected: BTreeMap<ScopeKey, Credential> = BTreeMap::new();

        match tier {
            PriorityTier::Low => {
                for credential in credentials.values() {
                    let mut regions: BTreeSet<String> = self
                        .inner
                        .settings
                        .regions_for(&credential.provider)
                        .into_iter()
                        .collect();
                    regions.extend(
                        counts
                            .keys()
                            .filter(|s| {
                                s.provider == credential.provider && s.credential_id == credential.id
                            })
                            .filter(|s| self.is_syncable(s))
                            .map(|s| s.region.clone()),
                    );
                    for region in regions {
                        let scope = ScopeKey::new(&credential.provider, &credential.id, region);
                        selected.insert(scope, credential.clone());
                    }
                }
            }
            PriorityTier::High | PriorityTier::Medium => {
                let thresholds = self.inner.settings.thresholds;
                for (scope, count) in counts {
                    if thresholds.tier(*count) != tier || !self.is_syncable(scope) {
                        continue;
                    }
                    match credentials.get(&scope.credential_id) {
                        Some(credential) if credential.provider == scope.provider => {
                            selected.insert(scope.clone(), credential.clone());
                        }
                        _ => debug!(scope = %scope, "Watched scope has no active credential"),
                    }
                }
            }
        }

        selected.into_iter().collect()
    }

    /// Tracked scopes come from the counter store, which any instance (or
    /// anything else with Redis access) may write.
    fn is_syncable(&self, scope: &ScopeKey) -> bool {
        if let Err(e) = scope.validate() {
            debug!(scope = %scope, error = %e, "Ignoring malformed tracked scope");
            return false;
        }
        if !self.inner.settings.regions.allows(&scope.provider, &scope.region) {
            debug!(scope = %scope, "Ignoring tracked scope in unknown region");
            return false;
        }
        true
    }

    fn mark_synced(&self, scope: &ScopeKey) {
        lock(&self.inner.last_synced).insert(scope.clone(), Instant::now());
    }

    /// Filters out fresh and in-flight scopes, claiming the rest.
    ///
    /// Also forgets scopes no tier can consider fresh: entries older than
    /// the Low interval, and after a Low enumeration, scopes that are no
    /// longer candidates at all.
    fn claim_due(
        &self,
        tier: PriorityTier,
        candidates: Vec<(ScopeKey, Credential)>,
    ) -> Vec<(InFlightClaim, Credential)> {
        let min_age = self.inner.settings.interval(tier).mul_f64(FRESHNESS_TOLERANCE);
        let now = Instant::now();
        let mut last_synced = lock(&self.inner.last_synced);
        let mut in_flight = lock(&self.inner.in_flight);

        let max_age = self.inner.settings.low_interval;
        last_synced.retain(|_, at| now.duration_since(*at) < max_age);
        if tier == PriorityTier::Low {
            let listed: HashSet<&ScopeKey> = candidates.iter().map(|(scope, _)| scope).collect();
            last_synced.retain(|scope, _| listed.contains(scope));
        }

        let mut due = Vec::new();
        for (scope, credential) in candidates {
            let fresh = last_synced
                .get(&scope)
                .is_some_and(|at| now.duration_since(*at) < min_age);
            if fresh || in_flight.contains(&scope) {
                continue;
            }
            in_flight.insert(scope.clone());
            due.push((
                InFlightClaim {
                    inner: self.inner.clone(),
                    scope,
                },
                credential,
            ));
        }
        due
    }

    /// Refreshes one scope and publishes its changes.
    pub async fn sync_scope(
        &self,
        scope: &ScopeKey,
        credential: &Credential,
    ) -> SyncResult<ChangeCounts> {
        let kind = self.kind();
        let key = snapshot_key(kind, scope);

        let previous = match self.inner.cache.get(&key).await? {
            Some(bytes) => match serde_json::from_slice::<ResourceSnapshot>(&bytes) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding corrupt cached snapshot");
                    None
                }
            },
            None => None,
        };

        let client = self.inner.providers.get(&scope.provider)?;
        let mut current = client
            .list_resources(kind, credential, &scope.region)
            .await?;
        current.kind = kind;
        current.scope = scope.clone();

        let deltas = previous
            .as_ref()
            .map(|prev| diff(prev, &current))
            .unwrap_or_default();

        let encoded = serde_json::to_vec(&current)?;
        self.inner
            .cache
            .set(&key, &encoded, self.inner.settings.ttl)
            .await?;
        self.mark_synced(scope);

        self.publish(ChangeEvent::listed(&current)).await;
        for event in &deltas {
            self.publish(event.clone()).await;
        }

        let changes = ChangeCounts::tally(&deltas);
        debug!(
            scope = %scope,
            kind = %kind,
            resources = current.len(),
            changes = changes.total(),
            "Scope synced"
        );
        Ok(changes)
    }

    async fn publish(&self, event: ChangeEvent) {
        let topic = event.topic();
        if let Err(e) = self.inner.bus.publish(&topic, event.into()).await {
            warn!(topic = %topic, error = %e, "Failed to publish change event");
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

#[derive(Default)]
pub struct SyncWorkerBuilder {
    workspaces: Option<Arc<dyn WorkspaceStore>>,
    credentials: Option<Arc<dyn CredentialStore>>,
    providers: Option<ProviderRegistry>,
    cache: Option<Arc<dyn CacheStore>>,
    tracker: Option<Arc<dyn SubscriptionTracker>>,
    bus: Option<Arc<dyn EventBus>>,
    settings: Option<SchedulerSettings>,
}

impl SyncWorkerBuilder {
    pub fn workspaces(mut self, store: Arc<dyn WorkspaceStore>) -> Self {
        self.workspaces = Some(store);
        self
    }

    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn providers(mut self, registry: ProviderRegistry) -> Self {
        self.providers = Some(registry);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn tracker(mut self, tracker: Arc<dyn SubscriptionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn build(self) -> SyncResult<SyncWorker> {
        fn missing(what: &str) -> SyncError {
            SyncError::InvalidConfig(format!("sync worker requires a {}", what))
        }

        let settings = self.settings.unwrap_or_default();
        if settings.max_concurrency == 0 {
            return Err(SyncError::InvalidConfig(
                "max_concurrency must be greater than 0".into(),
            ));
        }
        if settings.page_size == 0 {
            return Err(SyncError::InvalidConfig(
                "workspace page size must be greater than 0".into(),
            ));
        }

        let permits = PriorityTier::ALL
            .iter()
            .map(|tier| (*tier, Arc::new(Semaphore::new(settings.max_concurrency))))
            .collect();

        let inner = WorkerInner {
            workspaces: self.workspaces.ok_or_else(|| missing("workspace store"))?,
            credentials: self.credentials.ok_or_else(|| missing("credential store"))?,
            providers: self.providers.ok_or_else(|| missing("provider registry"))?,
            cache: self.cache.ok_or_else(|| missing("cache"))?,
            tracker: self.tracker.ok_or_else(|| missing("subscription tracker"))?,
            bus: self.bus.ok_or_else(|| missing("event bus"))?,
            settings,
            permits,
            last_synced: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            tracker_degraded: AtomicBool::new(false),
        };

        Ok(SyncWorker {
            inner: Arc::new(inner),
        })
    }
}
