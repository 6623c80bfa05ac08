//! # Real-time Fan-out Hub
//!
//! Routes bus events to connected clients, filtered per connection.
//!
//! ## Actor Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Hub actor                                  │
//! │                                                                         │
//! │  HubHandle ──HubCommand──►  ┌────────────────────────────────────────┐ │
//! │  (axum handlers)            │ HashMap<ConnectionId, ClientConnection>│ │
//! │                             └──────┬─────────────────────┬───────────┘ │
//! │  EventBus ──BusMessage (*)──►      │ try_send            │ inc / dec   │
//! │                                    ▼                     ▼             │
//! │  heartbeat tick ──►        mpsc::Sender<HubFrame>   tracker updater    │
//! │  reaper tick    ──►        (one per client)         (FIFO task)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The connection map has a single owner, so there is no lock around it.
//! A slow client only ever loses its own frames; a vanished client is
//! evicted on the next delivery attempt and its scopes are released.
//!
//! Every event gets one id, shared by all connections it reaches. Events
//! routed to an identified user are kept in a bounded per-user history, so a
//! client that reconnects with its last seen id gets what it missed right
//! after the `connected` event.

mod connection;
mod history;
pub mod server;

pub use connection::{
    ConnectionId, ConnectionInfo, ConnectionState, HubFrame, ScopeFilter, SubscriptionTarget,
    Subscriptions,
};
pub use server::HubServer;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nimbus_core::{BusEvent, RegionTable, ScopeKey, CONNECTED_EVENT};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::connection::{ClientConnection, Delivery};
use self::history::EventHistory;
use crate::bus::{EventBus, Subscription, TopicPattern};
use crate::config::HubSettings;
use crate::error::{SyncError, SyncResult};
use crate::tracker::SubscriptionTracker;

const COMMAND_BUFFER: usize = 256;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub client_buffer: usize,
    pub history_capacity: usize,
    pub history_ttl: Duration,
    /// Regions a scope subscription may name.
    pub regions: RegionTable,
}

impl HubConfig {
    pub fn from_settings(settings: &HubSettings) -> Self {
        HubConfig {
            heartbeat_interval: settings.heartbeat_interval(),
            idle_timeout: settings.idle_timeout(),
            reap_interval: settings.reap_interval(),
            client_buffer: settings.client_buffer,
            history_capacity: settings.history_capacity,
            history_ttl: settings.history_ttl(),
            regions: RegionTable::new(),
        }
    }

    pub fn with_regions(mut self, regions: RegionTable) -> Self {
        self.regions = regions;
        self
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_settings(&HubSettings::default())
    }
}

// =============================================================================
// Commands
// =============================================================================

enum HubCommand {
    Connect {
        user_id: Option<String>,
        last_event_id: Option<u64>,
        reply: oneshot::Sender<ConnectionGrant>,
    },
    Subscribe {
        id: ConnectionId,
        target: SubscriptionTarget,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Unsubscribe {
        id: ConnectionId,
        target: SubscriptionTarget,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Disconnect {
        id: ConnectionId,
    },
    ConnectionInfo {
        id: ConnectionId,
        reply: oneshot::Sender<SyncResult<ConnectionInfo>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// What a new client receives from `connect`.
pub struct ConnectionGrant {
    pub id: ConnectionId,
    /// Outbound frames. The first one is always the `connected` event,
    /// followed by any replayed history.
    pub frames: mpsc::Receiver<HubFrame>,
    /// Number of history events queued after the `connected` event.
    pub replayed: usize,
    /// Fires when the hub closes this connection.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub delivered: u64,
    pub dropped: u64,
    /// Distinct concrete scopes currently held by any connection.
    pub tracked_scopes: usize,
    /// Users with replayable history.
    pub history_users: usize,
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable front door to the hub actor.
#[derive(Clone)]
pub struct HubHandle {
    cmd_tx: mpsc::Sender<HubCommand>,
    cancel: CancellationToken,
}

impl HubHandle {
    async fn send(&self, cmd: HubCommand) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SyncError::ChannelError("Hub channel closed".into()))
    }

    async fn wait<T>(rx: oneshot::Receiver<T>) -> SyncResult<T> {
        rx.await
            .map_err(|_| SyncError::ChannelError("Hub dropped reply".into()))
    }

    /// Registers a new client connection.
    ///
    /// With a user id and `last_event_id`, that user's newer history is
    /// queued right after the `connected` event.
    pub async fn connect(
        &self,
        user_id: Option<String>,
        last_event_id: Option<u64>,
    ) -> SyncResult<ConnectionGrant> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Connect {
            user_id,
            last_event_id,
            reply,
        })
        .await?;
        Self::wait(rx).await
    }

    pub async fn subscribe(&self, id: ConnectionId, target: SubscriptionTarget) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Subscribe { id, target, reply }).await?;
        Self::wait(rx).await?
    }

    pub async fn unsubscribe(
        &self,
        id: ConnectionId,
        target: SubscriptionTarget,
    ) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Unsubscribe { id, target, reply })
            .await?;
        Self::wait(rx).await?
    }

    /// Evicts a connection. Unknown ids are ignored.
    pub async fn disconnect(&self, id: ConnectionId) -> SyncResult<()> {
        self.send(HubCommand::Disconnect { id }).await
    }

    /// Best-effort disconnect for drop paths that cannot await.
    pub fn disconnect_nowait(&self, id: ConnectionId) {
        match self.cmd_tx.try_send(HubCommand::Disconnect { id }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                // The reaper collects the connection if no runtime is around.
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let tx = self.cmd_tx.clone();
                    runtime.spawn(async move {
                        let _ = tx.send(cmd).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub async fn connection_info(&self, id: ConnectionId) -> SyncResult<ConnectionInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::ConnectionInfo { id, reply }).await?;
        Self::wait(rx).await?
    }

    pub async fn stats(&self) -> SyncResult<HubStats> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply }).await?;
        Self::wait(rx).await
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.cmd_tx.is_closed()
    }

    /// Closes every connection and stops the actor.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Hub
// =============================================================================

pub struct Hub {
    config: HubConfig,
    bus: Arc<dyn EventBus>,
    tracker: Arc<dyn SubscriptionTracker>,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        bus: Arc<dyn EventBus>,
        tracker: Arc<dyn SubscriptionTracker>,
    ) -> Self {
        Hub {
            config,
            bus,
            tracker,
        }
    }

    /// Spawns the actor.
    pub fn start(self) -> (HubHandle, JoinHandle<()>) {
        self.start_with_token(CancellationToken::new())
    }

    /// Spawns the actor, stopping when `cancel` fires.
    ///
    /// The bus subscription is taken before this returns, so events
    /// published afterwards are never missed.
    pub fn start_with_token(self, cancel: CancellationToken) -> (HubHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (tracker_tx, tracker_rx) = mpsc::unbounded_channel();

        let events = self.bus.subscribe(TopicPattern::all());
        let updater = tokio::spawn(tracker_updater(self.tracker, tracker_rx));

        let history = EventHistory::new(self.config.history_capacity, self.config.history_ttl);
        let actor = HubActor {
            config: self.config,
            history,
            connections: HashMap::new(),
            tracker_tx,
            cancel: cancel.clone(),
            next_event_id: 0,
            delivered: 0,
            dropped: 0,
        };
        let task = tokio::spawn(actor.run(cmd_rx, events, updater));

        info!("Fan-out hub started");
        (HubHandle { cmd_tx, cancel }, task)
    }
}

// =============================================================================
// Tracker Updater
// =============================================================================

enum TrackerUpdate {
    Increment(ScopeKey),
    Decrement(ScopeKey),
}

/// Applies demand changes in arrival order.
async fn tracker_updater(
    tracker: Arc<dyn SubscriptionTracker>,
    mut rx: mpsc::UnboundedReceiver<TrackerUpdate>,
) {
    while let Some(update) = rx.recv().await {
        match update {
            TrackerUpdate::Increment(scope) => match tracker.increment(&scope).await {
                Ok(count) => debug!(scope = %scope, count, "Subscriber count incremented"),
                Err(e) => warn!(scope = %scope, ?e, "Failed to record subscriber"),
            },
            TrackerUpdate::Decrement(scope) => match tracker.decrement(&scope).await {
                Ok(count) => debug!(scope = %scope, count, "Subscriber count decremented"),
                Err(e) => warn!(scope = %scope, ?e, "Failed to release subscriber"),
            },
        }
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Assigns the event its id and payload on first use.
fn stamp<'a>(
    slot: &'a mut Option<(u64, serde_json::Value)>,
    next_event_id: &mut u64,
    event: &BusEvent,
) -> &'a (u64, serde_json::Value) {
    slot.get_or_insert_with(|| {
        *next_event_id += 1;
        (*next_event_id, event.payload())
    })
}

struct HubActor {
    config: HubConfig,
    connections: HashMap<ConnectionId, ClientConnection>,
    history: EventHistory,
    tracker_tx: mpsc::UnboundedSender<TrackerUpdate>,
    cancel: CancellationToken,
    next_event_id: u64,
    delivered: u64,
    dropped: u64,
}

impl HubActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<HubCommand>,
        mut events: Subscription,
        updater: JoinHandle<()>,
    ) {
        let now = Instant::now();
        let mut heartbeat =
            interval_at(now + self.config.heartbeat_interval, self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reaper = interval_at(now + self.config.reap_interval, self.config.reap_interval);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut bus_open = true;
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(cmd) = cmd_rx.recv() => self.handle_command(cmd),
                msg = events.recv(), if bus_open => match msg {
                    Some(msg) => self.broadcast(msg.event),
                    None => {
                        warn!("Event bus closed, hub stops receiving events");
                        bus_open = false;
                    }
                },
                _ = heartbeat.tick() => self.heartbeat(),
                _ = reaper.tick() => self.reap(),
            }
        }

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.evict(id, "hub shutting down");
        }

        // Let queued decrements reach the tracker before returning.
        drop(self.tracker_tx);
        let _ = updater.await;
        info!("Fan-out hub stopped");
    }

    fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Connect {
                user_id,
                last_event_id,
                reply,
            } => {
                let grant = self.connect(user_id, last_event_id);
                if reply.send(grant).is_err() {
                    debug!("Connect caller went away");
                }
            }
            HubCommand::Subscribe { id, target, reply } => {
                let _ = reply.send(self.subscribe(id, target));
            }
            HubCommand::Unsubscribe { id, target, reply } => {
                let _ = reply.send(self.unsubscribe(id, &target));
            }
            HubCommand::Disconnect { id } => {
                if self.connections.contains_key(&id) {
                    self.evict(id, "client disconnected");
                }
            }
            HubCommand::ConnectionInfo { id, reply } => {
                let info = self
                    .connections
                    .get(&id)
                    .map(ClientConnection::info)
                    .ok_or_else(|| SyncError::ConnectionNotFound(id.to_string()));
                let _ = reply.send(info);
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_event_id += 1;
        self.next_event_id
    }

    fn connect(&mut self, user_id: Option<String>, last_event_id: Option<u64>) -> ConnectionGrant {
        let id = Uuid::new_v4();
        let missed = match (&user_id, last_event_id) {
            (Some(user), Some(after)) => self.history.since(user, after),
            _ => Vec::new(),
        };
        // Room for the replay on top of the buffer.
        let capacity = self.config.client_buffer.max(1) + missed.len();
        let (tx, frames) = mpsc::channel(capacity);
        let cancel = self.cancel.child_token();

        if let Some(user) = &user_id {
            self.history.resume(user);
        }
        let mut conn = ClientConnection::new(id, user_id, tx, cancel.clone());
        let hello = HubFrame::Event {
            id: self.next_id(),
            name: CONNECTED_EVENT.to_string(),
            data: json!({
                "connection_id": id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        };
        // The channel is empty, sized for these frames, and its receiver is
        // in hand, so they all land.
        let _ = conn.deliver(hello);
        let replayed = missed.len();
        for frame in missed {
            let _ = conn.deliver(frame);
        }
        conn.state = ConnectionState::Open;

        info!(
            connection_id = %id,
            user_id = ?conn.user_id,
            ?last_event_id,
            replayed,
            "Client connected"
        );
        self.connections.insert(id, conn);

        ConnectionGrant {
            id,
            frames,
            cancel,
            replayed,
        }
    }

    fn subscribe(&mut self, id: ConnectionId, target: SubscriptionTarget) -> SyncResult<()> {
        target.validate(&self.config.regions)?;
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| SyncError::ConnectionNotFound(id.to_string()))?;
        conn.touch();

        let demand = match &target {
            SubscriptionTarget::Scope(filter) => filter.as_scope(),
            _ => None,
        };
        let added = conn.subscriptions.add(target.clone());
        debug!(connection_id = %id, ?target, added, "Subscribe");

        if added {
            if let Some(scope) = demand {
                self.track(TrackerUpdate::Increment(scope));
            }
        }
        Ok(())
    }

    fn unsubscribe(&mut self, id: ConnectionId, target: &SubscriptionTarget) -> SyncResult<()> {
        target.validate(&self.config.regions)?;
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| SyncError::ConnectionNotFound(id.to_string()))?;
        conn.touch();

        let removed = conn.subscriptions.remove(target);
        debug!(connection_id = %id, ?target, removed, "Unsubscribe");

        if removed {
            if let SubscriptionTarget::Scope(filter) = target {
                if let Some(scope) = filter.as_scope() {
                    self.track(TrackerUpdate::Decrement(scope));
                }
            }
        }
        Ok(())
    }

    fn track(&self, update: TrackerUpdate) {
        if self.tracker_tx.send(update).is_err() {
            warn!("Tracker updater stopped, subscriber count not recorded");
        }
    }

    fn broadcast(&mut self, event: BusEvent) {
        let event_type = event.event_type();
        let mut stamped: Option<(u64, serde_json::Value)> = None;
        let mut closed = Vec::new();

        for (id, conn) in self.connections.iter_mut() {
            if !conn.is_open() {
                continue;
            }
            if !conn.subscriptions.accepts(&event, &event_type) {
                debug!(connection_id = %id, event_type = %event_type, "Filtered event");
                continue;
            }

            let (event_id, data) = stamp(&mut stamped, &mut self.next_event_id, &event);
            if let Some(user) = &conn.user_id {
                self.history.record(user, *event_id, &event_type, data);
            }
            let frame = HubFrame::Event {
                id: *event_id,
                name: event_type.clone(),
                data: data.clone(),
            };

            match conn.deliver(frame) {
                Delivery::Sent => self.delivered += 1,
                Delivery::Full => {
                    self.dropped += 1;
                    debug!(connection_id = %id, event_type = %event_type, "Client buffer full, event dropped");
                }
                Delivery::Closed => closed.push(*id),
            }
        }

        for user in self.history.away_accepting(&event, &event_type) {
            let (event_id, data) = stamp(&mut stamped, &mut self.next_event_id, &event);
            self.history.record(&user, *event_id, &event_type, data);
        }

        for id in closed {
            self.evict(id, "client channel closed");
        }
    }

    fn heartbeat(&mut self) {
        let mut closed = Vec::new();
        for (id, conn) in self.connections.iter_mut() {
            if !conn.is_open() {
                continue;
            }
            match conn.deliver(HubFrame::Heartbeat) {
                Delivery::Sent => conn.touch(),
                Delivery::Full => {}
                Delivery::Closed => closed.push(*id),
            }
        }
        for id in closed {
            self.evict(id, "client channel closed");
        }
    }

    fn reap(&mut self) {
        let idle_timeout = self.config.idle_timeout;
        let idle: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|conn| conn.last_activity.elapsed() > idle_timeout)
            .map(|conn| conn.id)
            .collect();

        for id in idle {
            self.evict(id, "idle timeout");
        }
        self.history.prune();
    }

    fn evict(&mut self, id: ConnectionId, reason: &str) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        conn.close();
        for scope in conn.subscriptions.concrete_scopes() {
            self.track(TrackerUpdate::Decrement(scope));
        }
        if let Some(user) = &conn.user_id {
            let still_here = self
                .connections
                .values()
                .any(|other| other.user_id.as_ref() == Some(user));
            if !still_here {
                self.history.park(user, conn.subscriptions.clone());
            }
        }
        info!(
            connection_id = %id,
            reason,
            delivered = conn.delivered,
            dropped = conn.dropped,
            "Client connection closed"
        );
    }

    fn stats(&self) -> HubStats {
        let tracked: HashSet<ScopeKey> = self
            .connections
            .values()
            .flat_map(|conn| conn.subscriptions.concrete_scopes())
            .collect();
        HubStats {
            connections: self.connections.len(),
            delivered: self.delivered,
            dropped: self.dropped,
            tracked_scopes: tracked.len(),
            history_users: self.history.users(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::tracker::MemoryTracker;
    use nimbus_core::{
        diff, ChangeEvent, ResourceKind, ResourceRecord, ResourceSnapshot, SystemNotice,
    };

    struct Fixture {
        bus: Arc<LocalBus>,
        tracker: Arc<MemoryTracker>,
        hub: HubHandle,
        task: JoinHandle<()>,
    }

    fn start(config: HubConfig) -> Fixture {
        let bus = Arc::new(LocalBus::new(64));
        let tracker = Arc::new(MemoryTracker::default());
        let (hub, task) = Hub::new(config, bus.clone(), tracker.clone()).start();
        Fixture {
            bus,
            tracker,
            hub,
            task,
        }
    }

    fn scope_target(provider: &str, credential: &str, region: &str) -> SubscriptionTarget {
        SubscriptionTarget::Scope(ScopeFilter::new(provider, credential, region))
    }

    fn vpc_created(provider: &str, credential: &str, region: &str, id: &str) -> ChangeEvent {
        let scope = ScopeKey::new(provider, credential, region);
        let prev = ResourceSnapshot::empty(ResourceKind::Vpc, scope.clone());
        let next = ResourceSnapshot::new(
            ResourceKind::Vpc,
            scope,
            vec![ResourceRecord::new(id, id, "pending", region)],
        );
        diff(&prev, &next).remove(0)
    }

    async fn next_event(grant: &mut ConnectionGrant) -> Option<(u64, String, serde_json::Value)> {
        loop {
            match tokio::time::timeout(Duration::from_millis(200), grant.frames.recv()).await {
                Ok(Some(HubFrame::Event { id, name, data })) => return Some((id, name, data)),
                Ok(Some(HubFrame::Heartbeat)) => continue,
                _ => return None,
            }
        }
    }

    /// Waits until the updater has applied queued tracker changes.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect_sends_connected_event() {
        let fx = start(HubConfig::default());
        let mut grant = fx.hub.connect(Some("user-1".into()), None).await.unwrap();

        let (id, name, data) = next_event(&mut grant).await.unwrap();
        assert_eq!(name, CONNECTED_EVENT);
        assert_eq!(id, 1);
        assert_eq!(data["connection_id"], json!(grant.id));
        assert!(data["timestamp"].is_string());

        let info = fx.hub.connection_info(grant.id).await.unwrap();
        assert_eq!(info.state, ConnectionState::Open);
        assert_eq!(info.user_id.as_deref(), Some("user-1"));
        assert!(info.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_subscribed_client_receives_matching_event() {
        let fx = start(HubConfig::default());
        let mut grant = fx.hub.connect(None, None).await.unwrap();
        next_event(&mut grant).await.unwrap();

        fx.hub
            .subscribe(grant.id, SubscriptionTarget::EventType("vpc-created".into()))
            .await
            .unwrap();
        fx.hub
            .subscribe(grant.id, scope_target("aws", "*", "us-east-1"))
            .await
            .unwrap();

        fx.bus
            .publish_event(vpc_created("aws", "cred-a", "us-east-1", "vpc-2").into())
            .await
            .unwrap();

        let (_, name, data) = next_event(&mut grant).await.unwrap();
        assert_eq!(name, "vpc-created");
        assert_eq!(data["resource_id"], "vpc-2");
        assert_eq!(data["provider"], "aws");
        assert_eq!(data["action"], "created");
    }

    #[tokio::test]
    async fn test_provider_mismatch_not_delivered() {
        let fx = start(HubConfig::default());
        let mut grant = fx.hub.connect(None, None).await.unwrap();
        next_event(&mut grant).await.unwrap();

        fx.hub
            .subscribe(grant.id, SubscriptionTarget::EventType("vpc-created".into()))
            .await
            .unwrap();
        fx.hub
            .subscribe(grant.id, scope_target("gcp", "cred-b", "*"))
            .await
            .unwrap();

        fx.bus
            .publish_event(vpc_created("aws", "cred-a", "us-east-1", "vpc-2").into())
            .await
            .unwrap();

        assert!(next_event(&mut grant).await.is_none());
    }

    #[tokio::test]
    async fn test_event_type_gate_applies_to_system_events() {
        let fx = start(HubConfig::default());
        let mut alerts = fx.hub.connect(None, None).await.unwrap();
        let mut quiet = fx.hub.connect(None, None).await.unwrap();
        next_event(&mut alerts).await.unwrap();
        next_event(&mut quiet).await.unwrap();

        fx.hub
            .subscribe(alerts.id, SubscriptionTarget::EventType("system-alert".into()))
            .await
            .unwrap();

        fx.bus
            .publish_event(SystemNotice::alert("quota exceeded").into())
            .await
            .unwrap();

        let (_, name, data) = next_event(&mut alerts).await.unwrap();
        assert_eq!(name, "system-alert");
        assert_eq!(data["message"], "quota exceeded");
        assert!(next_event(&mut quiet).await.is_none());
    }

    #[tokio::test]
    async fn test_event_ids_increase() {
        let fx = start(HubConfig::default());
        let mut grant = fx.hub.connect(None, None).await.unwrap();
        let (first, _, _) = next_event(&mut grant).await.unwrap();

        fx.hub
            .subscribe(grant.id, SubscriptionTarget::EventType("system-notification".into()))
            .await
            .unwrap();
        for _ in 0..3 {
            fx.bus
                .publish_event(SystemNotice::notification("hi").into())
                .await
                .unwrap();
        }

        let mut last = first;
        for _ in 0..3 {
            let (id, _, _) = next_event(&mut grant).await.unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn test_one_id_per_event_across_connections() {
        let fx = start(HubConfig::default());
        let mut a = fx.hub.connect(None, None).await.unwrap();
        let mut b = fx.hub.connect(None, None).await.unwrap();
        next_event(&mut a).await.unwrap();
        next_event(&mut b).await.unwrap();
        for id in [a.id, b.id] {
            fx.hub
                .subscribe(id, SubscriptionTarget::EventType("system-alert".into()))
                .await
                .unwrap();
        }

        fx.bus
            .publish_event(SystemNotice::alert("x").into())
            .await
            .unwrap();

        let (id_a, _, _) = next_event(&mut a).await.unwrap();
        let (id_b, _, _) = next_event(&mut b).await.unwrap();
        assert_eq!(id_a, id_b);
    }

    async fn notify(fx: &Fixture, message: &str) {
        fx.bus
            .publish_event(SystemNotice::notification(message).into())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_replays_missed_events() {
        let fx = start(HubConfig::default());
        let mut first = fx.hub.connect(Some("user-1".into()), None).await.unwrap();
        next_event(&mut first).await.unwrap();
        fx.hub
            .subscribe(first.id, SubscriptionTarget::EventType("system-notification".into()))
            .await
            .unwrap();

        notify(&fx, "seen").await;
        let (seen_id, _, data) = next_event(&mut first).await.unwrap();
        assert_eq!(data["message"], "seen");

        fx.hub.disconnect(first.id).await.unwrap();
        notify(&fx, "missed-1").await;
        notify(&fx, "missed-2").await;
        settle().await;
        assert_eq!(fx.hub.stats().await.unwrap().history_users, 1);

        let mut again = fx
            .hub
            .connect(Some("user-1".into()), Some(seen_id))
            .await
            .unwrap();
        assert_eq!(again.replayed, 2);

        let (_, name, _) = next_event(&mut again).await.unwrap();
        assert_eq!(name, CONNECTED_EVENT);
        let (id1, name, data) = next_event(&mut again).await.unwrap();
        assert_eq!(name, "system-notification");
        assert_eq!(data["message"], "missed-1");
        let (id2, _, data) = next_event(&mut again).await.unwrap();
        assert_eq!(data["message"], "missed-2");
        assert!(seen_id < id1 && id1 < id2);
        assert!(next_event(&mut again).await.is_none());
    }

    #[tokio::test]
    async fn test_replay_needs_user_and_last_event_id() {
        let fx = start(HubConfig::default());
        let mut grant = fx.hub.connect(Some("user-1".into()), None).await.unwrap();
        next_event(&mut grant).await.unwrap();
        fx.hub
            .subscribe(grant.id, SubscriptionTarget::EventType("system-notification".into()))
            .await
            .unwrap();
        notify(&fx, "one").await;
        next_event(&mut grant).await.unwrap();

        // Another user and an anonymous client see none of user-1's history.
        let other = fx.hub.connect(Some("user-2".into()), Some(0)).await.unwrap();
        assert_eq!(other.replayed, 0);
        let anonymous = fx.hub.connect(None, Some(0)).await.unwrap();
        assert_eq!(anonymous.replayed, 0);
        // Without a last event id nothing is replayed.
        let fresh = fx.hub.connect(Some("user-1".into()), None).await.unwrap();
        assert_eq!(fresh.replayed, 0);

        let full = fx.hub.connect(Some("user-1".into()), Some(0)).await.unwrap();
        assert_eq!(full.replayed, 1);
    }

    #[tokio::test]
    async fn test_subscribe_rejects_unsafe_or_unknown_scope() {
        let config =
            HubConfig::default().with_regions(RegionTable::new().with("aws", vec!["local-1".into()]));
        let fx = start(config);
        let grant = fx.hub.connect(None, None).await.unwrap();

        for target in [
            scope_target("aws", "../../etc", "us-east-1"),
            scope_target("aws", "cred-a", "../us-east-1"),
            scope_target("aws", "cred-a", "atlantis-1"),
        ] {
            assert!(matches!(
                fx.hub.subscribe(grant.id, target).await,
                Err(SyncError::InvalidSubscription(_))
            ));
        }
        fx.hub
            .subscribe(grant.id, scope_target("aws", "cred-a", "local-1"))
            .await
            .unwrap();
        settle().await;

        let counts = fx.tracker.snapshot_counts().await.unwrap();
        assert_eq!(counts.len(), 1);
        assert!(counts.contains_key(&ScopeKey::new("aws", "cred-a", "local-1")));
    }

    #[tokio::test]
    async fn test_concrete_scopes_drive_tracker() {
        let fx = start(HubConfig::default());
        let grant = fx.hub.connect(None, None).await.unwrap();
        let scope = ScopeKey::new("aws", "cred-a", "us-east-1");

        fx.hub
            .subscribe(grant.id, scope_target("aws", "cred-a", "us-east-1"))
            .await
            .unwrap();
        // Duplicate and wildcard subscriptions add no demand.
        fx.hub
            .subscribe(grant.id, scope_target("aws", "cred-a", "us-east-1"))
            .await
            .unwrap();
        fx.hub
            .subscribe(grant.id, scope_target("aws", "*", "us-east-1"))
            .await
            .unwrap();
        settle().await;

        let counts = fx.tracker.snapshot_counts().await.unwrap();
        assert_eq!(counts.get(&scope), Some(&1));
        assert_eq!(counts.len(), 1);

        fx.hub
            .unsubscribe(grant.id, scope_target("aws", "cred-a", "us-east-1"))
            .await
            .unwrap();
        settle().await;
        assert!(fx.tracker.snapshot_counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_releases_scopes() {
        let fx = start(HubConfig::default());
        let a = fx.hub.connect(None, None).await.unwrap();
        let b = fx.hub.connect(None, None).await.unwrap();
        let scope = ScopeKey::new("aws", "cred-a", "us-east-1");

        for id in [a.id, b.id] {
            fx.hub
                .subscribe(id, scope_target("aws", "cred-a", "us-east-1"))
                .await
                .unwrap();
        }
        settle().await;
        assert_eq!(fx.tracker.snapshot_counts().await.unwrap()[&scope], 2);

        fx.hub.disconnect(a.id).await.unwrap();
        settle().await;
        assert_eq!(fx.tracker.snapshot_counts().await.unwrap()[&scope], 1);
        assert!(a.cancel.is_cancelled());
        assert!(matches!(
            fx.hub.connection_info(a.id).await,
            Err(SyncError::ConnectionNotFound(_))
        ));

        let stats = fx.hub.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.tracked_scopes, 1);
    }

    #[tokio::test]
    async fn test_unknown_connection_and_bad_target() {
        let fx = start(HubConfig::default());
        let missing = fx
            .hub
            .subscribe(Uuid::new_v4(), SubscriptionTarget::EventType("vpc-created".into()))
            .await;
        assert!(matches!(missing, Err(SyncError::ConnectionNotFound(_))));

        let grant = fx.hub.connect(None, None).await.unwrap();
        let bad = fx
            .hub
            .subscribe(grant.id, SubscriptionTarget::ResourceId(String::new()))
            .await;
        assert!(matches!(bad, Err(SyncError::InvalidSubscription(_))));

        // Disconnecting twice is harmless.
        fx.hub.disconnect(grant.id).await.unwrap();
        fx.hub.disconnect(grant.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_client_drops_without_blocking_others() {
        let config = HubConfig {
            client_buffer: 2,
            ..HubConfig::default()
        };
        let fx = start(config);
        let mut slow = fx.hub.connect(None, None).await.unwrap();
        let mut fast = fx.hub.connect(None, None).await.unwrap();
        for id in [slow.id, fast.id] {
            fx.hub
                .subscribe(id, SubscriptionTarget::EventType("system-notification".into()))
                .await
                .unwrap();
        }
        next_event(&mut fast).await.unwrap();

        for i in 0..4 {
            fx.bus
                .publish_event(SystemNotice::notification(format!("n{}", i)).into())
                .await
                .unwrap();
            // The fast client keeps reading.
            let (_, _, data) = next_event(&mut fast).await.unwrap();
            assert_eq!(data["message"], format!("n{}", i));
        }

        let stats = fx.hub.stats().await.unwrap();
        assert!(stats.dropped >= 2);
        assert_eq!(stats.connections, 2);

        // The slow client still gets what fit in its buffer.
        let (_, name, _) = next_event(&mut slow).await.unwrap();
        assert_eq!(name, CONNECTED_EVENT);
        let (_, _, data) = next_event(&mut slow).await.unwrap();
        assert_eq!(data["message"], "n0");
    }

    #[tokio::test]
    async fn test_closed_client_evicted_on_delivery() {
        let fx = start(HubConfig::default());
        let grant = fx.hub.connect(None, None).await.unwrap();
        fx.hub
            .subscribe(grant.id, SubscriptionTarget::EventType("system-alert".into()))
            .await
            .unwrap();
        fx.hub
            .subscribe(grant.id, scope_target("aws", "cred-a", "us-east-1"))
            .await
            .unwrap();

        let ConnectionGrant { id, frames, .. } = grant;
        drop(frames);

        fx.bus
            .publish_event(SystemNotice::alert("x").into())
            .await
            .unwrap();
        settle().await;

        assert!(fx.hub.connection_info(id).await.is_err());
        settle().await;
        assert!(fx.tracker.snapshot_counts().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_reading_clients_alive() {
        let config = HubConfig {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            client_buffer: 64,
            ..HubConfig::default()
        };
        let fx = start(config);
        let mut grant = fx.hub.connect(None, None).await.unwrap();

        let mut heartbeats = 0;
        let deadline = Instant::now() + Duration::from_secs(400);
        while Instant::now() < deadline {
            if let Some(HubFrame::Heartbeat) = grant.frames.recv().await {
                heartbeats += 1;
            }
        }
        assert!(heartbeats >= 10);
        assert!(fx.hub.connection_info(grant.id).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_evicts_stuck_client() {
        let config = HubConfig {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            client_buffer: 1,
            ..HubConfig::default()
        };
        let fx = start(config);
        // Never reads: the connected event fills the buffer, heartbeats fail.
        let grant = fx.hub.connect(None, None).await.unwrap();
        fx.hub
            .subscribe(grant.id, scope_target("aws", "cred-a", "us-east-1"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(fx.hub.connection_info(grant.id).await.is_ok());

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(fx.hub.connection_info(grant.id).await.is_err());
        assert!(grant.cancel.is_cancelled());
        settle().await;
        assert!(fx.tracker.snapshot_counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let fx = start(HubConfig::default());
        let grant = fx.hub.connect(None, None).await.unwrap();
        fx.hub
            .subscribe(grant.id, scope_target("aws", "cred-a", "us-east-1"))
            .await
            .unwrap();

        fx.hub.shutdown();
        fx.task.await.unwrap();

        assert!(grant.cancel.is_cancelled());
        assert!(!fx.hub.is_running());
        assert!(matches!(
            fx.hub.connect(None, None).await,
            Err(SyncError::ShuttingDown)
        ));
        assert!(fx.tracker.snapshot_counts().await.unwrap().is_empty());
    }
}
