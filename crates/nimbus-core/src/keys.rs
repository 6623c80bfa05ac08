//! # Key Layout
//!
//! Names of everything stored in the shared Redis instance. Other services
//! read these keys directly, so the layout is part of the external contract.
//!
//! ```text
//! vpc:aws:<credential>:us-east-1            snapshot (JSON), TTL per kind
//! subscriptions:aws:<credential>:us-east-1  subscriber counter, TTL 2h
//! health_check                              primary cache liveness probe
//! ```

use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::types::{ResourceKind, ScopeKey};

/// Prefix of subscriber counter keys.
pub const SUBSCRIPTION_PREFIX: &str = "subscriptions";

/// Key probed with `EXISTS` to decide whether the primary cache is healthy.
pub const HEALTH_PROBE_KEY: &str = "health_check";

pub const TTL_SHORT: Duration = Duration::from_secs(30);
pub const TTL_MEDIUM: Duration = Duration::from_secs(5 * 60);

/// Lifetime of an idle subscriber counter.
pub const SUBSCRIPTION_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Cache key of a snapshot: `<kind>:<provider>:<credential>:<region>`.
pub fn snapshot_key(kind: ResourceKind, scope: &ScopeKey) -> String {
    format!(
        "{}:{}:{}:{}",
        kind, scope.provider, scope.credential_id, scope.region
    )
}

/// Counter key of a subscription scope.
pub fn subscription_key(scope: &ScopeKey) -> String {
    format!("{}:{}", SUBSCRIPTION_PREFIX, scope)
}

/// `SCAN MATCH` pattern covering every subscription counter.
pub fn subscription_pattern() -> String {
    format!("{}:*", SUBSCRIPTION_PREFIX)
}

/// Recovers the scope from a counter key.
pub fn parse_subscription_key(key: &str) -> CoreResult<ScopeKey> {
    key.strip_prefix(SUBSCRIPTION_PREFIX)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or_else(|| CoreError::InvalidSubscriptionKey(key.to_string()))?
        .parse()
}
