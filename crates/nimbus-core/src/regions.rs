//! Supported providers and the regions the slow sweep always covers.

use std::collections::BTreeMap;

use crate::WILDCARD;

/// Providers the scheduler will sync.
pub const SUPPORTED_PROVIDERS: [&str; 4] = ["aws", "gcp", "azure", "ncp"];

const AWS_REGIONS: &[&str] = &["ap-northeast-2", "us-east-1", "us-west-2", "eu-west-1"];
const GCP_REGIONS: &[&str] = &["asia-northeast3", "asia-northeast1", "us-central1", "europe-west1"];
const AZURE_REGIONS: &[&str] = &["koreacentral", "eastus", "westus", "westeurope"];
const NCP_REGIONS: &[&str] = &["KR"];

/// Returns true if the provider name is one the scheduler understands.
pub fn is_supported(provider: &str) -> bool {
    SUPPORTED_PROVIDERS.contains(&provider)
}

/// Regions swept for a provider when nothing more specific is configured.
///
/// Unknown providers get an empty list: only scopes with live subscribers
/// are synced for them.
pub fn default_regions(provider: &str) -> &'static [&'static str] {
    match provider {
        "aws" => AWS_REGIONS,
        "gcp" => GCP_REGIONS,
        "azure" => AZURE_REGIONS,
        "ncp" => NCP_REGIONS,
        _ => &[],
    }
}

/// Built-in region lists with per-provider overrides from configuration.
///
/// An override replaces the list the Low sweep walks. It does not shrink
/// the set of regions a client may subscribe to: a region is accepted if
/// either list names it, or if the provider has no list at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionTable {
    overrides: BTreeMap<String, Vec<String>>,
}

impl RegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the sweep list of `provider`. An empty list is ignored.
    pub fn set(&mut self, provider: impl Into<String>, regions: Vec<String>) {
        if !regions.is_empty() {
            self.overrides.insert(provider.into(), regions);
        }
    }

    pub fn with(mut self, provider: impl Into<String>, regions: Vec<String>) -> Self {
        self.set(provider, regions);
        self
    }

    /// Regions the Low sweep covers for `provider`.
    pub fn sweep_regions(&self, provider: &str) -> Vec<String> {
        match self.overrides.get(provider) {
            Some(regions) => regions.clone(),
            None => default_regions(provider)
                .iter()
                .map(|r| r.to_string())
                .collect(),
        }
    }

    /// Whether a subscription or tracked scope may name `region`.
    pub fn allows(&self, provider: &str, region: &str) -> bool {
        if region == WILDCARD {
            return true;
        }
        let builtin = default_regions(provider);
        let configured = self.overrides.get(provider);
        if builtin.is_empty() && configured.is_none() {
            return true;
        }
        builtin.contains(&region)
            || configured.is_some_and(|regions| regions.iter().any(|r| r == region))
    }
}
