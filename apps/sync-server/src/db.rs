//! Read-only directory over PostgreSQL.
//!
//! The tables belong to the CRUD service; the sync server only lists
//! workspaces and their active credentials.

use async_trait::async_trait;
use nimbus_sync::{
    Credential, CredentialStore, SyncError, SyncResult, Workspace, WorkspaceStore,
};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;
use uuid::Uuid;

use crate::error::ServerError;

/// Database connection pool.
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    /// Connect to the database.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, ServerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        info!(max_connections, "Connected to PostgreSQL");
        Ok(PgDirectory { pool })
    }
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct WorkspaceRow {
    id: Uuid,
    name: String,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Workspace {
            id: row.id.to_string(),
            name: row.name,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CredentialRow {
    id: Uuid,
    workspace_id: Uuid,
    provider: String,
    is_active: bool,
}

impl From<CredentialRow> for Credential {
    fn from(row: CredentialRow) -> Self {
        Credential {
            id: row.id.to_string(),
            workspace_id: row.workspace_id.to_string(),
            provider: row.provider.to_lowercase(),
            active: row.is_active,
        }
    }
}

fn directory_error(e: sqlx::Error) -> SyncError {
    SyncError::Directory(e.to_string())
}

// =============================================================================
// Directory Traits
// =============================================================================

#[async_trait]
impl WorkspaceStore for PgDirectory {
    async fn list_all(&self, limit: usize, offset: usize) -> SyncResult<Vec<Workspace>> {
        let limit = i64::try_from(limit).map_err(|_| SyncError::Directory("page size too large".into()))?;
        let offset = i64::try_from(offset).map_err(|_| SyncError::Directory("offset too large".into()))?;

        let rows = sqlx::query_as::<_, WorkspaceRow>(
            r#"
            SELECT id, name
            FROM workspaces
            WHERE deleted_at IS NULL
            ORDER BY created_at, id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(directory_error)?;

        Ok(rows.into_iter().map(Workspace::from).collect())
    }
}

#[async_trait]
impl CredentialStore for PgDirectory {
    async fn list_active_by_workspace(&self, workspace_id: &str) -> SyncResult<Vec<Credential>> {
        let workspace_id = Uuid::parse_str(workspace_id)
            .map_err(|e| SyncError::Directory(format!("invalid workspace id {}: {}", workspace_id, e)))?;

        let rows = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT id, workspace_id, provider, is_active
            FROM credentials
            WHERE workspace_id = $1 AND is_active = true AND deleted_at IS NULL
            "#,
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .map_err(directory_error)?;

        Ok(rows.into_iter().map(Credential::from).collect())
    }
}
