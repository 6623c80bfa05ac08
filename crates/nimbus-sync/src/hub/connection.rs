//! # Client Connections
//!
//! Per-connection state owned by the hub actor, and the subscription gates
//! every event must pass before it is queued for a client.
//!
//! ## Delivery Gates
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  event "vpc-created" for aws:cred-a:us-east-1, resource vpc-7           │
//! │                                                                         │
//! │  gate 1: is "vpc-created" in event_types?            no ──► skip       │
//! │                     │ yes                                               │
//! │  gate 2: system event?                              yes ──► deliver    │
//! │                     │ no                                                │
//! │          vpc-7 in resource_ids, or a scope filter                       │
//! │          aws:cred-a:us-east-1 / aws:*:us-east-1 / aws:cred-a:* / ...    │
//! │          matches?                                   yes ──► deliver    │
//! │                                                      no ──► skip       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use nimbus_core::{check_segment, BusEvent, RegionTable, ScopeKey, WILDCARD};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

pub type ConnectionId = Uuid;

// =============================================================================
// Connection State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

// =============================================================================
// Subscription Targets
// =============================================================================

fn wildcard() -> String {
    WILDCARD.to_string()
}

/// Scope filter; credential and region may be `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeFilter {
    pub provider: String,
    #[serde(default = "wildcard")]
    pub credential_id: String,
    #[serde(default = "wildcard")]
    pub region: String,
}

impl ScopeFilter {
    pub fn new(
        provider: impl Into<String>,
        credential_id: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        ScopeFilter {
            provider: provider.into(),
            credential_id: credential_id.into(),
            region: region.into(),
        }
    }

    pub fn is_concrete(&self) -> bool {
        self.credential_id != WILDCARD && self.region != WILDCARD
    }

    /// The exact scope this filter names, if it has no wildcard.
    pub fn as_scope(&self) -> Option<ScopeKey> {
        self.is_concrete()
            .then(|| ScopeKey::new(&self.provider, &self.credential_id, &self.region))
    }

    pub fn matches(&self, scope: &ScopeKey) -> bool {
        self.provider == scope.provider
            && (self.credential_id == WILDCARD || self.credential_id == scope.credential_id)
            && (self.region == WILDCARD || self.region == scope.region)
    }

    fn validate(&self, regions: &RegionTable) -> SyncResult<()> {
        if self.provider.is_empty() || self.provider == WILDCARD {
            return Err(SyncError::InvalidSubscription(
                "scope filter needs a concrete provider".into(),
            ));
        }
        if self.credential_id.is_empty() || self.region.is_empty() {
            return Err(SyncError::InvalidSubscription(
                "scope filter fields must not be empty".into(),
            ));
        }
        check_segment("provider", &self.provider)?;
        if self.credential_id != WILDCARD {
            check_segment("credential_id", &self.credential_id)?;
        }
        if self.region != WILDCARD {
            check_segment("region", &self.region)?;
        }
        if !regions.allows(&self.provider, &self.region) {
            return Err(SyncError::InvalidSubscription(format!(
                "unknown region '{}' for provider '{}'",
                self.region, self.provider
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ScopeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.provider, self.credential_id, self.region)
    }
}

/// What a client asks to receive.
///
/// Serialized as `{"event_type": "vpc-created"}`, `{"resource_id": "vpc-1"}`
/// or `{"scope": {"provider": "aws", "credential_id": "c", "region": "r"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTarget {
    EventType(String),
    ResourceId(String),
    Scope(ScopeFilter),
}

impl SubscriptionTarget {
    /// Rejects empty targets, unsafe scope segments and regions the
    /// provider does not serve.
    pub fn validate(&self, regions: &RegionTable) -> SyncResult<()> {
        match self {
            SubscriptionTarget::EventType(name) if name.trim().is_empty() => Err(
                SyncError::InvalidSubscription("event type must not be empty".into()),
            ),
            SubscriptionTarget::ResourceId(id) if id.trim().is_empty() => Err(
                SyncError::InvalidSubscription("resource id must not be empty".into()),
            ),
            SubscriptionTarget::Scope(filter) => filter.validate(regions),
            _ => Ok(()),
        }
    }
}

/// The three subscription sets of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Subscriptions {
    pub event_types: BTreeSet<String>,
    pub resource_ids: BTreeSet<String>,
    pub scopes: BTreeSet<ScopeFilter>,
}

impl Subscriptions {
    /// Returns true if the target was not already present.
    pub fn add(&mut self, target: SubscriptionTarget) -> bool {
        match target {
            SubscriptionTarget::EventType(name) => self.event_types.insert(name),
            SubscriptionTarget::ResourceId(id) => self.resource_ids.insert(id),
            SubscriptionTarget::Scope(filter) => self.scopes.insert(filter),
        }
    }

    /// Returns true if the target was present.
    pub fn remove(&mut self, target: &SubscriptionTarget) -> bool {
        match target {
            SubscriptionTarget::EventType(name) => self.event_types.remove(name),
            SubscriptionTarget::ResourceId(id) => self.resource_ids.remove(id),
            SubscriptionTarget::Scope(filter) => self.scopes.remove(filter),
        }
    }

    /// Applies both delivery gates.
    pub fn accepts(&self, event: &BusEvent, event_type: &str) -> bool {
        if !self.event_types.contains(event_type) {
            return false;
        }
        match event {
            BusEvent::System(_) => true,
            BusEvent::Change(change) => {
                change
                    .resource_id()
                    .is_some_and(|id| self.resource_ids.contains(id))
                    || self.scopes.iter().any(|f| f.matches(&change.scope))
            }
        }
    }

    /// Scopes counted as subscriber demand.
    pub fn concrete_scopes(&self) -> impl Iterator<Item = ScopeKey> + '_ {
        self.scopes.iter().filter_map(ScopeFilter::as_scope)
    }

    pub fn is_empty(&self) -> bool {
        self.event_types.is_empty() && self.resource_ids.is_empty() && self.scopes.is_empty()
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Unit queued on a client's outbound channel.
#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    Event {
        id: u64,
        name: String,
        data: serde_json::Value,
    },
    Heartbeat,
}

/// Result of queueing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    /// Buffer full; the frame was dropped for this client only.
    Full,
    /// The client side is gone.
    Closed,
}

// =============================================================================
// Client Connection
// =============================================================================

pub(crate) struct ClientConnection {
    pub id: ConnectionId,
    pub user_id: Option<String>,
    pub state: ConnectionState,
    pub subscriptions: Subscriptions,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub delivered: u64,
    pub dropped: u64,
    tx: mpsc::Sender<HubFrame>,
    cancel: CancellationToken,
}

impl ClientConnection {
    pub fn new(
        id: ConnectionId,
        user_id: Option<String>,
        tx: mpsc::Sender<HubFrame>,
        cancel: CancellationToken,
    ) -> Self {
        ClientConnection {
            id,
            user_id,
            state: ConnectionState::Connecting,
            subscriptions: Subscriptions::default(),
            connected_at: Utc::now(),
            last_activity: Instant::now(),
            delivered: 0,
            dropped: 0,
            tx,
            cancel,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Queues a frame without waiting.
    pub fn deliver(&mut self, frame: HubFrame) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.delivered += 1;
                Delivery::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped += 1;
                Delivery::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Marks the connection closed and ends its stream.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        self.cancel.cancel();
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            user_id: self.user_id.clone(),
            state: self.state,
            subscriptions: self.subscriptions.clone(),
            connected_at: self.connected_at,
            idle_secs: self.last_activity.elapsed().as_secs(),
            delivered: self.delivered,
            dropped: self.dropped,
        }
    }
}

/// Snapshot of one connection for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub user_id: Option<String>,
    pub state: ConnectionState,
    pub subscriptions: Subscriptions,
    pub connected_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::{ResourceKind, ResourceRecord, ResourceSnapshot, SystemNotice};

    fn created(provider: &str, credential: &str, region: &str, id: &str) -> BusEvent {
        let prev = ResourceSnapshot::empty(
            ResourceKind::Vpc,
            ScopeKey::new(provider, credential, region),
        );
        let next = ResourceSnapshot::new(
            ResourceKind::Vpc,
            ScopeKey::new(provider, credential, region),
            vec![ResourceRecord::new(id, id, "available", region)],
        );
        nimbus_core::diff(&prev, &next).remove(0).into()
    }

    #[test]
    fn test_target_wire_format() {
        let target: SubscriptionTarget =
            serde_json::from_str(r#"{"event_type":"vpc-created"}"#).unwrap();
        assert_eq!(target, SubscriptionTarget::EventType("vpc-created".into()));

        let target: SubscriptionTarget =
            serde_json::from_str(r#"{"scope":{"provider":"aws","region":"us-east-1"}}"#).unwrap();
        assert_eq!(
            target,
            SubscriptionTarget::Scope(ScopeFilter::new("aws", "*", "us-east-1"))
        );
    }

    #[test]
    fn test_target_validation() {
        let regions = RegionTable::new();
        assert!(SubscriptionTarget::EventType("".into()).validate(&regions).is_err());
        assert!(SubscriptionTarget::ResourceId(" ".into()).validate(&regions).is_err());
        assert!(SubscriptionTarget::Scope(ScopeFilter::new("*", "c", "r"))
            .validate(&regions)
            .is_err());
        assert!(SubscriptionTarget::Scope(ScopeFilter::new("aws", "*", "*"))
            .validate(&regions)
            .is_ok());
    }

    #[test]
    fn test_scope_filter_rejects_unsafe_segments() {
        let regions = RegionTable::new();
        let scope = |p: &str, c: &str, r: &str| {
            SubscriptionTarget::Scope(ScopeFilter::new(p, c, r)).validate(&regions)
        };

        assert!(matches!(
            scope("aws", "../../etc", "us-east-1"),
            Err(SyncError::InvalidSubscription(_))
        ));
        assert!(scope("aws", "cred-a", "us-east-1/../x").is_err());
        assert!(scope("aws/..", "*", "*").is_err());
        assert!(scope("aws", "a:b", "*").is_err());
        assert!(scope("aws", "cred-a", "us-east-1").is_ok());
    }

    #[test]
    fn test_scope_filter_rejects_unknown_region() {
        let regions = RegionTable::new().with("aws", vec!["me-central-9".into()]);
        let scope = |p: &str, r: &str| {
            SubscriptionTarget::Scope(ScopeFilter::new(p, "cred-a", r)).validate(&regions)
        };

        assert!(scope("aws", "atlantis-1").is_err());
        assert!(scope("aws", "us-east-1").is_ok());
        assert!(scope("aws", "me-central-9").is_ok());
        assert!(scope("aws", "*").is_ok());
        assert!(scope("gcp", "atlantis-1").is_err());
    }

    #[test]
    fn test_scope_filter_matching() {
        let scope = ScopeKey::new("aws", "cred-a", "us-east-1");
        assert!(ScopeFilter::new("aws", "cred-a", "us-east-1").matches(&scope));
        assert!(ScopeFilter::new("aws", "*", "us-east-1").matches(&scope));
        assert!(ScopeFilter::new("aws", "cred-a", "*").matches(&scope));
        assert!(!ScopeFilter::new("gcp", "*", "*").matches(&scope));
        assert!(!ScopeFilter::new("aws", "cred-b", "*").matches(&scope));

        assert!(ScopeFilter::new("aws", "*", "us-east-1").as_scope().is_none());
        assert_eq!(
            ScopeFilter::new("aws", "cred-a", "us-east-1").as_scope(),
            Some(scope)
        );
    }

    #[test]
    fn test_event_type_gate() {
        let mut subs = Subscriptions::default();
        subs.add(SubscriptionTarget::Scope(ScopeFilter::new("aws", "*", "*")));

        let event = created("aws", "cred-a", "us-east-1", "vpc-1");
        assert!(!subs.accepts(&event, &event.event_type()));

        subs.add(SubscriptionTarget::EventType("vpc-created".into()));
        assert!(subs.accepts(&event, &event.event_type()));
    }

    #[test]
    fn test_change_events_need_scope_or_resource() {
        let mut subs = Subscriptions::default();
        subs.add(SubscriptionTarget::EventType("vpc-created".into()));

        let event = created("aws", "cred-a", "us-east-1", "vpc-1");
        assert!(!subs.accepts(&event, &event.event_type()));

        subs.add(SubscriptionTarget::ResourceId("vpc-1".into()));
        assert!(subs.accepts(&event, &event.event_type()));

        let other = created("aws", "cred-a", "us-east-1", "vpc-2");
        assert!(!subs.accepts(&other, &other.event_type()));
    }

    #[test]
    fn test_system_events_pass_second_gate() {
        let mut subs = Subscriptions::default();
        let alert: BusEvent = SystemNotice::alert("quota").into();
        assert!(!subs.accepts(&alert, &alert.event_type()));

        subs.add(SubscriptionTarget::EventType("system-alert".into()));
        assert!(subs.accepts(&alert, &alert.event_type()));
    }

    #[test]
    fn test_add_remove_idempotent() {
        let mut subs = Subscriptions::default();
        let target = SubscriptionTarget::Scope(ScopeFilter::new("aws", "cred-a", "us-east-1"));
        assert!(subs.add(target.clone()));
        assert!(!subs.add(target.clone()));
        assert_eq!(subs.concrete_scopes().count(), 1);
        assert!(subs.remove(&target));
        assert!(!subs.remove(&target));
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn test_deliver_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let mut conn = ClientConnection::new(Uuid::new_v4(), None, tx, CancellationToken::new());

        assert_eq!(conn.deliver(HubFrame::Heartbeat), Delivery::Sent);
        assert_eq!(conn.deliver(HubFrame::Heartbeat), Delivery::Full);
        assert_eq!(conn.dropped, 1);

        drop(rx);
        assert_eq!(conn.deliver(HubFrame::Heartbeat), Delivery::Closed);
    }
}
