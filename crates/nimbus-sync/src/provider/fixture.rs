//! File-backed provider client for local runs and demos.
//!
//! Records are read from `<dir>/<kind>/<credential_id>/<region>.json`, a
//! JSON array of resource records. A missing file means the scope has no
//! resources; editing a file between ticks produces change events. A
//! credential id or region that could leave that tree is refused.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nimbus_core::{check_segment, ResourceKind, ResourceRecord, ResourceSnapshot, ScopeKey};
use tracing::debug;

use super::{ProviderClient, ProviderError};
use crate::config::ProviderSettings;
use crate::directory::Credential;
use crate::error::{SyncError, SyncResult};

pub struct FixtureProvider {
    name: String,
    dir: PathBuf,
}

impl FixtureProvider {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        FixtureProvider {
            name: name.into(),
            dir: dir.into(),
        }
    }

    fn path_for(
        &self,
        kind: ResourceKind,
        credential_id: &str,
        region: &str,
    ) -> Result<PathBuf, ProviderError> {
        check_segment("credential_id", credential_id)
            .and_then(|()| check_segment("region", region))
            .map_err(|e| ProviderError::InvalidScope {
                provider: self.name.clone(),
                message: e.to_string(),
            })?;
        Ok(self
            .dir
            .join(kind.as_str())
            .join(credential_id)
            .join(format!("{}.json", region)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ProviderClient for FixtureProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_resources(
        &self,
        kind: ResourceKind,
        credential: &Credential,
        region: &str,
    ) -> Result<ResourceSnapshot, ProviderError> {
        let scope = ScopeKey::new(&self.name, &credential.id, region);
        let path = self.path_for(kind, &credential.id, region)?;

        let contents = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(?path, "No fixture for scope, reporting no resources");
                return Ok(ResourceSnapshot::empty(kind, scope));
            }
            Err(e) => {
                return Err(ProviderError::Request {
                    provider: self.name.clone(),
                    message: format!("{}: {}", path.display(), e),
                })
            }
        };

        let records: Vec<ResourceRecord> =
            serde_json::from_slice(&contents).map_err(|e| ProviderError::Request {
                provider: self.name.clone(),
                message: format!("{}: {}", path.display(), e),
            })?;

        Ok(ResourceSnapshot::new(kind, scope, records))
    }
}

/// Factory building a [`FixtureProvider`] for every provider that names a
/// `fixture_dir`.
pub fn fixture_factory(
    name: &str,
    settings: &ProviderSettings,
) -> SyncResult<Arc<dyn ProviderClient>> {
    let dir = settings.fixture_dir.as_ref().ok_or_else(|| {
        SyncError::InvalidConfig(format!(
            "provider '{}' has no client available; set providers.{}.fixture_dir",
            name, name
        ))
    })?;
    Ok(Arc::new(FixtureProvider::new(name, dir)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Credential {
        Credential {
            id: "cred-a".into(),
            workspace_id: "ws-1".into(),
            provider: "aws".into(),
            active: true,
        }
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("nimbus-fixture-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_missing_fixture_is_empty() {
        let provider = FixtureProvider::new("aws", scratch_dir());
        let snapshot = provider
            .list_resources(ResourceKind::Vpc, &credential(), "us-east-1")
            .await
            .unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.scope, ScopeKey::new("aws", "cred-a", "us-east-1"));
    }

    #[tokio::test]
    async fn test_reads_records() {
        let dir = scratch_dir();
        let file_dir = dir.join("vpc").join("cred-a");
        std::fs::create_dir_all(&file_dir).unwrap();
        std::fs::write(
            file_dir.join("us-east-1.json"),
            r#"[{"id":"vpc-1","name":"main","state":"available","region":"us-east-1"}]"#,
        )
        .unwrap();

        let provider = FixtureProvider::new("aws", &dir);
        let snapshot = provider
            .list_resources(ResourceKind::Vpc, &credential(), "us-east-1")
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.find("vpc-1").unwrap().state, "available");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_malformed_fixture_is_request_error() {
        let dir = scratch_dir();
        let file_dir = dir.join("subnet").join("cred-a");
        std::fs::create_dir_all(&file_dir).unwrap();
        std::fs::write(file_dir.join("KR.json"), "{oops").unwrap();

        let provider = FixtureProvider::new("ncp", &dir);
        let err = provider
            .list_resources(ResourceKind::Subnet, &credential(), "KR")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Request { .. }));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let dir = scratch_dir();
        let outside = dir.join("outside.json");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&outside, "[]").unwrap();

        let provider = FixtureProvider::new("aws", dir.join("root"));
        for region in ["../../../outside", "a/b", "..", ""] {
            let err = provider
                .list_resources(ResourceKind::Vpc, &credential(), region)
                .await
                .unwrap_err();
            assert!(matches!(err, ProviderError::InvalidScope { .. }), "{}", region);
            assert!(!err.is_transient());
        }

        let mut sneaky = credential();
        sneaky.id = "../cred-a".into();
        assert!(matches!(
            provider
                .list_resources(ResourceKind::Vpc, &sneaky, "us-east-1")
                .await,
            Err(ProviderError::InvalidScope { .. })
        ));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_factory_requires_fixture_dir() {
        assert!(fixture_factory("aws", &ProviderSettings::default()).is_err());

        let settings = ProviderSettings {
            fixture_dir: Some(PathBuf::from("/tmp/fixtures")),
            ..ProviderSettings::default()
        };
        let client = fixture_factory("aws", &settings).unwrap();
        assert_eq!(client.name(), "aws");
    }
}
