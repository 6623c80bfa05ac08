//! # Sync Error Types
//!
//! Error types for the sync engine and the fan-out hub.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Cache       │  │     Collaborators       │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  CacheBackend   │  │  Provider               │ │
//! │  │  InvalidUrl     │  │  CacheUnavail.  │  │  UnknownProvider        │ │
//! │  │  ConfigLoad...  │  │                 │  │  TrackerUnavailable     │ │
//! │  └─────────────────┘  └─────────────────┘  │  Directory / Bus        │ │
//! │                                            └─────────────────────────┘ │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │      Hub        │  │  Serialization  │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  ConnectionNot..│  │  Serialization  │  │  ShuttingDown           │ │
//! │  │  InvalidSubscr..│  │  Deserialization│  │  ChannelError           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every failure is scoped to the smallest unit that produced it (one scope
//! in one pass, one client connection). Only configuration errors are
//! expected to stop the process.

use thiserror::Error;

use crate::provider::ProviderError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all engine failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration or missing collaborator.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid Redis URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// A single cache tier failed.
    #[error("Cache backend error: {0}")]
    CacheBackend(String),

    /// Both cache tiers failed for the same call.
    #[error("Cache unavailable (primary: {primary}; secondary: {secondary})")]
    CacheUnavailable { primary: String, secondary: String },

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Subscription counter store unreachable.
    #[error("Subscription tracker unavailable: {0}")]
    TrackerUnavailable(String),

    /// A provider call failed.
    #[error("Provider error: {0}")]
    Provider(ProviderError),

    /// No client registered for the provider.
    #[error("No provider client registered for '{0}'")]
    UnknownProvider(String),

    /// Workspace or credential lookup failed.
    #[error("Directory error: {0}")]
    Directory(String),

    /// Publishing to the event bus failed.
    #[error("Event bus error: {0}")]
    Bus(String),

    // =========================================================================
    // Hub Errors
    // =========================================================================
    /// The connection id is not (or no longer) registered.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// Malformed subscription request.
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// Listener or socket failure.
    #[error("Transport error: {0}")]
    TransportError(String),

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    /// A component is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        SyncError::Provider(err)
    }
}

impl From<nimbus_core::CoreError> for SyncError {
    fn from(err: nimbus_core::CoreError) -> Self {
        SyncError::InvalidSubscription(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            SyncError::DeserializationFailed(err.to_string())
        } else {
            SyncError::SerializationFailed(err.to_string())
        }
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the same operation may succeed on the next tick.
    ///
    /// ## Retryable Errors
    /// - Cache and tracker outages
    /// - Transient provider failures (timeouts, rate limits)
    /// - Directory and bus hiccups
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Rejected credentials, unsupported kinds
    /// - Malformed client requests
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Provider(err) => err.is_transient(),
            other => matches!(
                other,
                SyncError::CacheBackend(_)
                    | SyncError::CacheUnavailable { .. }
                    | SyncError::TrackerUnavailable(_)
                    | SyncError::Directory(_)
                    | SyncError::Bus(_)
                    | SyncError::TransportError(_)
            ),
        }
    }
}
