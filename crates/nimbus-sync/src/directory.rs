//! # Directory Collaborators
//!
//! Read-only access to workspaces and cloud credentials. The scheduler uses
//! these only to enumerate sync candidates and never mutates them.
//!
//! Production deployments back both traits with the relational store owned
//! by the CRUD layer; [`MemoryDirectory`] serves configuration-driven and
//! test setups.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;

/// A tenant workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A cloud credential registered in a workspace. Secrets never reach the
/// sync engine; provider clients resolve them by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub workspace_id: String,
    pub provider: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Lists workspaces page by page.
    async fn list_all(&self, limit: usize, offset: usize) -> SyncResult<Vec<Workspace>>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Lists the active credentials of one workspace.
    async fn list_active_by_workspace(&self, workspace_id: &str) -> SyncResult<Vec<Credential>>;
}

// =============================================================================
// In-memory directory
// =============================================================================

/// Fixed set of workspaces and credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryDirectory {
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

impl MemoryDirectory {
    pub fn new(workspaces: Vec<Workspace>, credentials: Vec<Credential>) -> Self {
        MemoryDirectory {
            workspaces,
            credentials,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }
}

#[async_trait]
impl WorkspaceStore for MemoryDirectory {
    async fn list_all(&self, limit: usize, offset: usize) -> SyncResult<Vec<Workspace>> {
        Ok(self
            .workspaces
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CredentialStore for MemoryDirectory {
    async fn list_active_by_workspace(&self, workspace_id: &str) -> SyncResult<Vec<Credential>> {
        Ok(self
            .credentials
            .iter()
            .filter(|c| c.active && c.workspace_id == workspace_id)
            .cloned()
            .collect())
    }
}
