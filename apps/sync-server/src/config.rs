//! Server process configuration.
//!
//! Loaded from environment variables with fallback to defaults. Engine
//! settings live in `sync.toml`; this only locates it and the database.

use std::env;
use std::path::PathBuf;

/// Sync server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Explicit path to `sync.toml`
    pub config_path: Option<PathBuf>,

    /// PostgreSQL connection string (optional)
    pub database_url: Option<String>,

    /// Pool size for the directory queries
    pub database_max_connections: u32,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let config = ServerConfig {
            config_path: non_empty("NIMBUS_CONFIG").map(PathBuf::from),

            database_url: non_empty("DATABASE_URL"),

            database_max_connections: non_empty("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|| "10".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DATABASE_MAX_CONNECTIONS".to_string()))?,
        };

        if config.database_max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "DATABASE_MAX_CONNECTIONS".to_string(),
            ));
        }

        if let Some(url) = &config.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
            }
        }

        Ok(config)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.config_path, None);
        assert_eq!(config.database_url, None);
        assert_eq!(config.database_max_connections, 10);
    }

    #[test]
    fn test_values_from_env() {
        let config = load(&[
            ("NIMBUS_CONFIG", "/etc/nimbus/sync.toml"),
            ("DATABASE_URL", "postgres://nimbus@localhost/nimbus"),
            ("DATABASE_MAX_CONNECTIONS", "4"),
        ])
        .unwrap();
        assert_eq!(
            config.config_path,
            Some(PathBuf::from("/etc/nimbus/sync.toml"))
        );
        assert_eq!(config.database_max_connections, 4);
    }

    #[test]
    fn test_empty_values_ignored() {
        let config = load(&[("DATABASE_URL", "  ")]).unwrap();
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("DATABASE_MAX_CONNECTIONS", "lots")]).is_err());
        assert!(load(&[("DATABASE_MAX_CONNECTIONS", "0")]).is_err());
        assert!(load(&[("DATABASE_URL", "mysql://x")]).is_err());
    }
}
