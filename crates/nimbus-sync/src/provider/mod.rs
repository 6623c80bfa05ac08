//! # Provider Clients
//!
//! The scheduler's only way to observe live cloud state.
//!
//! ## Registry
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  [providers.aws]  ─┐                                                    │
//! │  [providers.gcp]  ─┼──► ProviderFactory ──► ProviderRegistry            │
//! │  [providers.ncp]  ─┘    (statically linked)  "aws" → Arc<dyn Client>    │
//! │                                              "gcp" → Arc<dyn Client>    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Clients are selected by configuration at startup; nothing is loaded at
//! runtime.

mod fixture;

pub use fixture::{fixture_factory, FixtureProvider};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use nimbus_core::{ResourceKind, ResourceSnapshot};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ProviderSettings;
use crate::directory::Credential;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Provider Errors
// =============================================================================

/// Failure of a single provider call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("{provider} request timed out")]
    Timeout { provider: String },

    #[error("{provider} rate limited the request")]
    RateLimited { provider: String },

    #[error("{provider} rejected credential {credential_id}")]
    Unauthorized {
        provider: String,
        credential_id: String,
    },

    #[error("{provider} cannot list {kind} resources")]
    Unsupported { provider: String, kind: ResourceKind },

    #[error("{provider} request failed: {message}")]
    Request { provider: String, message: String },

    #[error("{provider} cannot address scope: {message}")]
    InvalidScope { provider: String, message: String },
}

impl ProviderError {
    /// Returns true if retrying on the next tick may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout { .. }
                | ProviderError::RateLimited { .. }
                | ProviderError::Request { .. }
        )
    }
}

// =============================================================================
// Provider Client
// =============================================================================

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider name this client serves.
    fn name(&self) -> &str;

    /// Lists every resource of `kind` visible to `credential` in `region`.
    async fn list_resources(
        &self,
        kind: ResourceKind,
        credential: &Credential,
        region: &str,
    ) -> Result<ResourceSnapshot, ProviderError>;
}

/// Builds a client for one configured provider.
pub type ProviderFactory = fn(&str, &ProviderSettings) -> SyncResult<Arc<dyn ProviderClient>>;

// =============================================================================
// Provider Registry
// =============================================================================

/// Provider name → client.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from the `[providers.*]` configuration sections.
    ///
    /// Disabled providers are skipped. Providers without a default region
    /// list are accepted with a warning: only watched scopes will be synced
    /// for them.
    pub fn from_settings(
        settings: &BTreeMap<String, ProviderSettings>,
        factory: ProviderFactory,
    ) -> SyncResult<Self> {
        let mut registry = Self::new();
        for (name, provider) in settings {
            if !provider.enabled {
                info!(provider = %name, "Provider disabled in configuration");
                continue;
            }
            if !nimbus_core::regions::is_supported(name) && provider.regions.is_empty() {
                warn!(provider = %name, "Provider has no default regions; only watched scopes will sync");
            }
            registry.register(factory(name, provider)?);
        }
        Ok(registry)
    }

    /// Registers (or replaces) a client under its own name.
    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        info!(provider = %client.name(), "Provider client registered");
        self.clients.insert(client.name().to_string(), client);
    }

    pub fn get(&self, provider: &str) -> SyncResult<Arc<dyn ProviderClient>> {
        self.clients
            .get(provider)
            .cloned()
            .ok_or_else(|| SyncError::UnknownProvider(provider.to_string()))
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.clients.contains_key(provider)
    }

    /// Registered provider names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
