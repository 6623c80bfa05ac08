//! # Error Types
//!
//! Domain errors for nimbus-core. These only arise from parsing and
//! validating values that cross a process boundary (Redis keys, control
//! messages, configuration).

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core domain errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A scope string did not have the `provider:credential:region` shape.
    #[error("Invalid scope '{0}': expected provider:credential:region")]
    InvalidScope(String),

    /// A scope field that cannot be used in keys or file paths.
    #[error("Invalid {field} '{value}': must be non-empty without '/', '\\', ':' or '..'")]
    InvalidSegment { field: &'static str, value: String },

    /// A tracker key did not carry the subscription prefix.
    #[error("Not a subscription key: {0}")]
    InvalidSubscriptionKey(String),

    /// Unknown resource kind name.
    #[error("Unknown resource kind: {0}")]
    UnknownResourceKind(String),

    /// Tier thresholds that would make a tier unreachable.
    ///
    /// ## When This Occurs
    /// - `medium` threshold is zero (every unwatched scope becomes Medium)
    /// - `high` threshold is not above `medium`
    #[error("Invalid tier thresholds: high={high}, medium={medium}")]
    InvalidThresholds { high: u64, medium: u64 },
}
