//! # Sync Scheduler
//!
//! Drives one [`SyncWorker`] with a timer loop per priority tier.
//!
//! ## Tier Loops
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncScheduler::start()                           │
//! │                                                                         │
//! │  t=0        initial sweep: run_pass(Low)                               │
//! │                                                                         │
//! │  HIGH   ──┬──── 60s ────┬──── 60s ────┬──── ...   watched ≥ 5          │
//! │  MEDIUM ──┴──────── 180s ─────────────┴──── ...   watched ≥ 1          │
//! │  LOW    ─────────────────────── 600s ───────────  everything           │
//! │                                                                         │
//! │  Loops share the worker's freshness ledger: a scope refreshed by a     │
//! │  faster tier is skipped by the slower ones until it ages out.          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Shutdown stops the loops between passes; a pass already running is
//! allowed to finish.

mod worker;

pub use worker::{PassReport, SchedulerSettings, SyncWorker, SyncWorkerBuilder};

use nimbus_core::PriorityTier;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct SyncScheduler {
    worker: SyncWorker,
}

impl SyncScheduler {
    pub fn new(worker: SyncWorker) -> Self {
        SyncScheduler { worker }
    }

    pub fn worker(&self) -> &SyncWorker {
        &self.worker
    }

    /// Spawns the tier loops.
    pub fn start(self) -> SchedulerHandle {
        self.start_with_token(CancellationToken::new())
    }

    /// Spawns the tier loops, stopping when `cancel` fires.
    pub fn start_with_token(self, cancel: CancellationToken) -> SchedulerHandle {
        info!(kind = %self.worker.kind(), "Sync scheduler starting");

        let tasks = PriorityTier::ALL
            .iter()
            .map(|tier| tokio::spawn(tier_loop(self.worker.clone(), *tier, cancel.clone())))
            .collect();

        SchedulerHandle { cancel, tasks }
    }
}

async fn tier_loop(worker: SyncWorker, tier: PriorityTier, cancel: CancellationToken) {
    let period = worker.settings().interval(tier);

    if tier == PriorityTier::Low && worker.settings().initial_sweep && !cancel.is_cancelled() {
        info!(kind = %worker.kind(), "Running initial sweep");
        worker.run_pass(tier).await;
    }

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                worker.run_pass(tier).await;
            }
        }
    }

    info!(tier = %tier, kind = %worker.kind(), "Tier loop stopped");
}

/// Handle to running tier loops.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Stops the loops and waits for in-flight passes to drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(?e, "Tier loop ended abnormally");
            }
        }
        info!("Sync scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use nimbus_core::{ResourceKind, ResourceSnapshot, ScopeKey};

    use super::*;
    use crate::bus::{EventBus, LocalBus, TopicPattern};
    use crate::cache::MemoryCache;
    use crate::directory::{Credential, MemoryDirectory, Workspace};
    use crate::provider::{ProviderClient, ProviderError, ProviderRegistry};
    use crate::tracker::{MemoryTracker, SubscriptionTracker};

    struct EmptyProvider;

    #[async_trait]
    impl ProviderClient for EmptyProvider {
        fn name(&self) -> &str {
            "aws"
        }

        async fn list_resources(
            &self,
            kind: ResourceKind,
            credential: &Credential,
            region: &str,
        ) -> Result<ResourceSnapshot, ProviderError> {
            Ok(ResourceSnapshot::empty(
                kind,
                ScopeKey::new("aws", &credential.id, region),
            ))
        }
    }

    fn worker(bus: Arc<LocalBus>, tracker: Arc<MemoryTracker>, initial_sweep: bool) -> SyncWorker {
        let dir = Arc::new(MemoryDirectory::new(
            vec![Workspace {
                id: "ws-1".into(),
                name: String::new(),
            }],
            vec![Credential {
                id: "cred-a".into(),
                workspace_id: "ws-1".into(),
                provider: "aws".into(),
                active: true,
            }],
        ));
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(EmptyProvider));

        let mut settings = SchedulerSettings::default();
        settings.high_interval = Duration::from_secs(10);
        settings.medium_interval = Duration::from_secs(20);
        settings.low_interval = Duration::from_secs(40);
        settings.initial_sweep = initial_sweep;
        settings.regions.set("aws", vec!["us-east-1".into()]);

        SyncWorker::builder()
            .workspaces(dir.clone())
            .credentials(dir)
            .providers(registry)
            .cache(Arc::new(MemoryCache::new(100)))
            .tracker(tracker)
            .bus(bus)
            .settings(settings)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_sweep_runs_immediately() {
        let bus = Arc::new(LocalBus::new(16));
        let mut events = bus.subscribe(TopicPattern::new("vpc.listed"));
        let handle = SyncScheduler::new(worker(bus, Arc::new(MemoryTracker::default()), true)).start();

        let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.topic, "vpc.listed");

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_tier_loop_refreshes_watched_scope() {
        let bus = Arc::new(LocalBus::new(16));
        let tracker = Arc::new(MemoryTracker::default());
        let scope = ScopeKey::new("aws", "cred-a", "us-east-1");
        for _ in 0..5 {
            tracker.increment(&scope).await.unwrap();
        }

        let mut events = bus.subscribe(TopicPattern::all());
        let handle = SyncScheduler::new(worker(bus, tracker, false)).start();

        // Nothing before the first high interval.
        assert!(tokio::time::timeout(Duration::from_secs(9), events.recv())
            .await
            .is_err());

        let msg = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.topic, "vpc.listed");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_loops() {
        let bus = Arc::new(LocalBus::new(16));
        let handle =
            SyncScheduler::new(worker(bus, Arc::new(MemoryTracker::default()), false)).start();
        assert!(handle.is_running());

        let token = handle.cancel_token();
        handle.shutdown().await;
        assert!(token.is_cancelled());
    }
}
