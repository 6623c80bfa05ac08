//! # Domain Types
//!
//! The unit of synchronization and the resource collections observed for it.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    ScopeKey     │   │ResourceSnapshot │   │ ResourceRecord  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  provider       │◄──│  scope          │   │  id             │       │
//! │  │  credential_id  │   │  kind           │──►│  name           │       │
//! │  │  region         │   │  records[]      │   │  state          │       │
//! │  └─────────────────┘   │  observed_at    │   │  attributes{}   │       │
//! │                        └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! A record is identified by `(provider, id)`. Within one snapshot the
//! provider is fixed by the scope, so the record id alone is the index key.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;
use crate::keys::{TTL_MEDIUM, TTL_SHORT};

// =============================================================================
// Scope Key
// =============================================================================

/// A `(provider, credential, region)` triple: the unit of synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ScopeKey {
    /// Provider name (`aws`, `gcp`, `azure`, `ncp`).
    pub provider: String,

    /// Credential used to talk to the provider.
    pub credential_id: String,

    /// Provider region.
    pub region: String,
}

impl ScopeKey {
    /// Creates a scope key.
    pub fn new(
        provider: impl Into<String>,
        credential_id: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        ScopeKey {
            provider: provider.into(),
            credential_id: credential_id.into(),
            region: region.into(),
        }
    }

    /// Checks that every field is safe to embed in a cache key or a path.
    pub fn validate(&self) -> Result<(), CoreError> {
        check_segment("provider", &self.provider)?;
        check_segment("credential_id", &self.credential_id)?;
        check_segment("region", &self.region)
    }
}

/// Rejects values that would break out of a `:`-separated key or a path
/// component.
pub fn check_segment(field: &'static str, value: &str) -> Result<(), CoreError> {
    let unsafe_char = |c: char| matches!(c, '/' | '\\' | ':') || c.is_control();
    if value.is_empty() || value.contains("..") || value.chars().any(unsafe_char) {
        return Err(CoreError::InvalidSegment {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.provider, self.credential_id, self.region)
    }
}

impl FromStr for ScopeKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(provider), Some(credential), Some(region))
                if !provider.is_empty()
                    && !credential.is_empty()
                    && !region.is_empty()
                    && !region.contains(':') =>
            {
                Ok(ScopeKey::new(provider, credential, region))
            }
            _ => Err(CoreError::InvalidScope(s.to_string())),
        }
    }
}

// =============================================================================
// Resource Kind
// =============================================================================

/// The kinds of resource the scheduler knows how to keep in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Vpc,
    Subnet,
    Cluster,
    Instance,
}

impl ResourceKind {
    /// Every kind, in a stable order.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Vpc,
        ResourceKind::Subnet,
        ResourceKind::Cluster,
        ResourceKind::Instance,
    ];

    /// Name used in cache keys and bus topics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Vpc => "vpc",
            ResourceKind::Subnet => "subnet",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Instance => "instance",
        }
    }

    /// Default cache TTL for snapshots of this kind.
    ///
    /// Network topology changes slowly; clusters and instances flip state
    /// often enough that a stale list is visible to users.
    pub fn default_ttl(&self) -> Duration {
        match self {
            ResourceKind::Vpc | ResourceKind::Subnet => TTL_MEDIUM,
            ResourceKind::Cluster | ResourceKind::Instance => TTL_SHORT,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vpc" | "vpcs" => Ok(ResourceKind::Vpc),
            "subnet" | "subnets" => Ok(ResourceKind::Subnet),
            "cluster" | "clusters" => Ok(ResourceKind::Cluster),
            "instance" | "instances" | "vm" => Ok(ResourceKind::Instance),
            other => Err(CoreError::UnknownResourceKind(other.to_string())),
        }
    }
}

// =============================================================================
// Resource Record
// =============================================================================

/// One concrete resource as reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ResourceRecord {
    /// Provider-assigned identifier.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Lifecycle state (`available`, `pending`, `RUNNING`, ...). Compared
    /// verbatim; providers disagree on casing.
    pub state: String,

    /// Region the resource lives in.
    pub region: String,

    /// Provider-specific attributes, kept opaque.
    #[serde(default)]
    #[ts(type = "Record<string, unknown>")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl ResourceRecord {
    /// Creates a record with no attributes.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        state: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        ResourceRecord {
            id: id.into(),
            name: name.into(),
            state: state.into(),
            region: region.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds a provider-specific attribute.
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Resource Snapshot
// =============================================================================

/// Every resource of one kind in one scope, as observed at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ResourceSnapshot {
    pub kind: ResourceKind,
    pub scope: ScopeKey,
    pub records: Vec<ResourceRecord>,
    #[ts(as = "String")]
    pub observed_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    /// Creates a snapshot observed now.
    pub fn new(kind: ResourceKind, scope: ScopeKey, records: Vec<ResourceRecord>) -> Self {
        ResourceSnapshot {
            kind,
            scope,
            records,
            observed_at: Utc::now(),
        }
    }

    /// Creates an empty snapshot observed now.
    pub fn empty(kind: ResourceKind, scope: ScopeKey) -> Self {
        Self::new(kind, scope, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Looks up a record by id.
    pub fn find(&self, id: &str) -> Option<&ResourceRecord> {
        self.records.iter().find(|r| r.id == id)
    }
}
