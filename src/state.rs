//! State File
//!
//! Remembers, per manifest address, the identity the backend assigned and
//! the last observed record. Written as pretty JSON; replaced atomically.

use crate::domain::ports::{Identity, ResourceKind};
use crate::error::{Error, Result};
use crate::manifest::{ManifestEntry, ResourceSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

pub const STATE_VERSION: u32 = 1;

/// A resource the reconciler created or imported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedResource {
    pub kind: ResourceKind,
    pub cx_profile_name: String,
    pub id: Identity,
    /// Desired record the resource was last reconciled with
    pub spec: ResourceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<Value>,
    /// Created, but a later create step failed; replaced on the next apply
    #[serde(default)]
    pub tainted: bool,
    pub updated_at: DateTime<Utc>,
}

impl TrackedResource {
    pub fn new(entry: &ManifestEntry, id: Identity, observed: Option<Value>) -> Self {
        Self {
            kind: entry.spec.kind(),
            cx_profile_name: entry.cx_profile_name.clone(),
            id,
            spec: entry.spec.clone(),
            observed,
            tainted: false,
            updated_at: Utc::now(),
        }
    }

    pub fn tainted(entry: &ManifestEntry, id: Identity) -> Self {
        Self {
            tainted: true,
            ..Self::new(entry, id, None)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    #[serde(default)]
    pub resources: BTreeMap<String, TrackedResource>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            resources: BTreeMap::new(),
        }
    }
}

impl StateFile {
    /// Load a state file; a missing file is an empty state
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No state at {}, starting empty", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let state: StateFile = serde_json::from_str(&contents)?;
        if state.version != STATE_VERSION {
            return Err(Error::Configuration(format!(
                "{}: unsupported state version {} (expected {})",
                path.display(),
                state.version,
                STATE_VERSION
            )));
        }
        Ok(state)
    }

    /// Write to a sibling temp file, then rename over `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved {} resources to {}", self.resources.len(), path.display());
        Ok(())
    }

    pub fn get(&self, address: &str) -> Option<&TrackedResource> {
        self.resources.get(address)
    }

    pub fn insert(&mut self, address: &str, resource: TrackedResource) {
        self.resources.insert(address.to_string(), resource);
    }

    pub fn remove(&mut self, address: &str) -> Option<TrackedResource> {
        self.resources.remove(address)
    }

    /// Addresses ordered so dependents (relationships, snapshots) come
    /// before the SVMs they live in
    pub fn destroy_order(&self) -> Vec<String> {
        let mut addresses: Vec<(&String, ResourceKind)> = self
            .resources
            .iter()
            .map(|(address, r)| (address, r.kind))
            .collect();
        addresses.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        addresses.into_iter().map(|(a, _)| a.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{SnapshotSpec, SvmSpec};
    use tempfile::TempDir;

    fn entry(address: &str, spec: ResourceSpec) -> ManifestEntry {
        ManifestEntry {
            address: address.into(),
            cx_profile_name: "cluster4".into(),
            spec,
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        assert!(StateFile::load(&path).unwrap().resources.is_empty());

        let mut state = StateFile::default();
        let svm = entry("svm.main", ResourceSpec::Svm(SvmSpec::new("tfsvm")));
        state.insert("svm.main", TrackedResource::new(&svm, Identity::new("svm-1"), None));
        state.save(&path).unwrap();

        let loaded = StateFile::load(&path).unwrap();
        assert_eq!(loaded, state);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"version": 99, "resources": {}}"#).unwrap();
        assert!(matches!(StateFile::load(&path), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_destroy_order_puts_dependents_first() {
        let mut state = StateFile::default();
        let svm = entry("a.svm", ResourceSpec::Svm(SvmSpec::new("tfsvm")));
        let snap = entry(
            "b.snapshot",
            ResourceSpec::Snapshot(SnapshotSpec::new("tfsvm", "v1", "s1")),
        );
        state.insert(&svm.address, TrackedResource::new(&svm, Identity::new("1"), None));
        state.insert(&snap.address, TrackedResource::tainted(&snap, Identity::new("2")));

        assert_eq!(state.destroy_order(), vec!["b.snapshot", "a.svm"]);
        assert!(state.get("b.snapshot").unwrap().tainted);
    }
}
