//! # Nimbus Sync Server
//!
//! Process wiring for the sync engine.
//!
//! ## Configuration
//! Environment variables:
//! - `NIMBUS_CONFIG` - Path to `sync.toml` (default: platform config dir)
//! - `DATABASE_URL` - PostgreSQL connection string; without it the static
//!   `[directory]` section of the config file is used
//! - `DATABASE_MAX_CONNECTIONS` - Pool size (default: 10)
//! - `RUST_LOG` - Log filter (default: `info,nimbus_sync=info`)
//!
//! Engine settings (`NIMBUS_REDIS_URL`, `NIMBUS_HUB_PORT`, ...) are read by
//! `nimbus_sync::SyncConfig`.

pub mod config;
pub mod db;
pub mod error;

// Re-exports
pub use config::ServerConfig;
pub use db::PgDirectory;
pub use error::ServerError;
