//! # Events
//!
//! What producers put on the bus and what real-time clients receive.
//!
//! ## Naming
//! ```text
//! ┌──────────────────────────┬────────────────────────┬─────────────────────┐
//! │ Event                    │ Bus topic              │ Client event name   │
//! ├──────────────────────────┼────────────────────────┼─────────────────────┤
//! │ Change(Listed)  of vpc   │ vpc.listed             │ vpc-listed          │
//! │ Change(Created) of vpc   │ vpc.created            │ vpc-created         │
//! │ Change(Updated) of vpc   │ vpc.updated            │ vpc-updated         │
//! │ Change(Deleted) of vpc   │ vpc.deleted            │ vpc-deleted         │
//! │ System(Notification)     │ system.notification    │ system-notification │
//! │ System(Alert)            │ system.alert           │ system-alert        │
//! └──────────────────────────┴────────────────────────┴─────────────────────┘
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use ts_rs::TS;

use crate::types::{ResourceKind, ResourceRecord, ResourceSnapshot, ScopeKey};

// =============================================================================
// Change Kind
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Listed,
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Listed => "listed",
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Change Event
// =============================================================================

/// The payload of a change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change {
    /// The full current collection. Published on every successful sync.
    Listed { records: Vec<ResourceRecord> },

    /// A resource that was not in the previous snapshot.
    Created { record: ResourceRecord },

    /// A resource whose lifecycle state changed.
    Updated {
        record: ResourceRecord,
        old_state: String,
        new_state: String,
    },

    /// A resource that disappeared. Carries the last known record.
    Deleted { record: ResourceRecord },
}

/// A change observed in one scope during one sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ChangeEvent {
    pub resource_kind: ResourceKind,
    pub scope: ScopeKey,
    #[ts(as = "String")]
    pub occurred_at: DateTime<Utc>,
    pub change: Change,
}

impl ChangeEvent {
    pub fn new(
        resource_kind: ResourceKind,
        scope: ScopeKey,
        occurred_at: DateTime<Utc>,
        change: Change,
    ) -> Self {
        ChangeEvent {
            resource_kind,
            scope,
            occurred_at,
            change,
        }
    }

    /// A `Listed` event carrying every record of the snapshot.
    pub fn listed(snapshot: &ResourceSnapshot) -> Self {
        ChangeEvent::new(
            snapshot.kind,
            snapshot.scope.clone(),
            snapshot.observed_at,
            Change::Listed {
                records: snapshot.records.clone(),
            },
        )
    }

    pub fn kind(&self) -> ChangeKind {
        match self.change {
            Change::Listed { .. } => ChangeKind::Listed,
            Change::Created { .. } => ChangeKind::Created,
            Change::Updated { .. } => ChangeKind::Updated,
            Change::Deleted { .. } => ChangeKind::Deleted,
        }
    }

    /// Id of the resource the event is about. `None` for `Listed`.
    pub fn resource_id(&self) -> Option<&str> {
        match &self.change {
            Change::Listed { .. } => None,
            Change::Created { record }
            | Change::Updated { record, .. }
            | Change::Deleted { record } => Some(record.id.as_str()),
        }
    }

    /// Bus topic: `<resourceKind>.<changeKind>`.
    pub fn topic(&self) -> String {
        format!("{}.{}", self.resource_kind, self.kind())
    }

    /// Client-facing event name: `<resourceKind>-<changeKind>`.
    pub fn event_type(&self) -> String {
        format!("{}-{}", self.resource_kind, self.kind())
    }

    /// JSON body delivered to real-time clients.
    ///
    /// The change details are decorated with the scope fields and the action
    /// so a client never has to correlate the event name with its payload.
    pub fn payload(&self) -> Value {
        let mut body = match &self.change {
            Change::Listed { records } => json!({
                "records": records,
                "count": records.len(),
            }),
            Change::Created { record } | Change::Deleted { record } => json!({
                "record": record,
            }),
            Change::Updated {
                record,
                old_state,
                new_state,
            } => json!({
                "record": record,
                "old_state": old_state,
                "new_state": new_state,
            }),
        };

        if let Value::Object(map) = &mut body {
            map.insert("provider".into(), json!(self.scope.provider));
            map.insert("credential_id".into(), json!(self.scope.credential_id));
            map.insert("region".into(), json!(self.scope.region));
            map.insert("resource_kind".into(), json!(self.resource_kind));
            map.insert("action".into(), json!(self.kind()));
            map.insert("timestamp".into(), json!(self.occurred_at.to_rfc3339()));
            if let Some(id) = self.resource_id() {
                map.insert("resource_id".into(), json!(id));
            }
        }
        body
    }
}

// =============================================================================
// System Notices
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Notification,
    Alert,
}

impl NoticeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeLevel::Notification => "notification",
            NoticeLevel::Alert => "alert",
        }
    }
}

/// An operator-facing message that every type-subscribed client receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SystemNotice {
    pub level: NoticeLevel,
    pub message: String,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub data: Value,
}

impl SystemNotice {
    pub fn notification(message: impl Into<String>) -> Self {
        SystemNotice {
            level: NoticeLevel::Notification,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn alert(message: impl Into<String>) -> Self {
        SystemNotice {
            level: NoticeLevel::Alert,
            message: message.into(),
            data: Value::Null,
        }
    }
}

// =============================================================================
// Bus Event
// =============================================================================

/// Everything that travels over the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "event", rename_all = "snake_case")]
pub enum BusEvent {
    Change(ChangeEvent),
    System(SystemNotice),
}

impl BusEvent {
    pub fn topic(&self) -> String {
        match self {
            BusEvent::Change(event) => event.topic(),
            BusEvent::System(notice) => format!("system.{}", notice.level.as_str()),
        }
    }

    pub fn event_type(&self) -> String {
        match self {
            BusEvent::Change(event) => event.event_type(),
            BusEvent::System(notice) => format!("system-{}", notice.level.as_str()),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, BusEvent::System(_))
    }

    pub fn payload(&self) -> Value {
        match self {
            BusEvent::Change(event) => event.payload(),
            BusEvent::System(notice) => json!({
                "level": notice.level,
                "message": notice.message,
                "data": notice.data,
            }),
        }
    }
}

impl From<ChangeEvent> for BusEvent {
    fn from(event: ChangeEvent) -> Self {
        BusEvent::Change(event)
    }
}

impl From<SystemNotice> for BusEvent {
    fn from(notice: SystemNotice) -> Self {
        BusEvent::System(notice)
    }
}
