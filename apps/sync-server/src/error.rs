//! Error types for the sync server.

use nimbus_sync::SyncError;

use crate::config::ConfigError;

/// Sync server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Sync engine error: {0}")]
    Sync(#[from] SyncError),
}

impl From<sqlx::Error> for ServerError {
    fn from(error: sqlx::Error) -> Self {
        ServerError::Database(error.to_string())
    }
}
