//! Desired-State Manifest
//!
//! A YAML list of resources, each with a unique address, the connection
//! profile it lives on and a `kind`-tagged desired record:
//!
//! ```yaml
//! resources:
//!   - address: svm.main
//!     cx_profile_name: cluster4
//!     kind: svm
//!     name: tfsvm
//!     max_volumes: "200"
//! ```

use crate::controller::{RelationshipSpec, SnapshotSpec, SvmSpec};
use crate::domain::ports::ResourceKind;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Desired record of one resource, tagged by kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    Svm(SvmSpec),
    Snapshot(SnapshotSpec),
    Snapmirror(RelationshipSpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Svm(_) => ResourceKind::Svm,
            ResourceSpec::Snapshot(_) => ResourceKind::Snapshot,
            ResourceSpec::Snapmirror(_) => ResourceKind::Snapmirror,
        }
    }
}

/// Typed access to one variant of [`ResourceSpec`]
pub trait SpecVariant: Sized {
    fn from_spec(spec: &ResourceSpec) -> Option<&Self>;
}

impl SpecVariant for SvmSpec {
    fn from_spec(spec: &ResourceSpec) -> Option<&Self> {
        match spec {
            ResourceSpec::Svm(spec) => Some(spec),
            _ => None,
        }
    }
}

impl SpecVariant for SnapshotSpec {
    fn from_spec(spec: &ResourceSpec) -> Option<&Self> {
        match spec {
            ResourceSpec::Snapshot(spec) => Some(spec),
            _ => None,
        }
    }
}

impl SpecVariant for RelationshipSpec {
    fn from_spec(spec: &ResourceSpec) -> Option<&Self> {
        match spec {
            ResourceSpec::Snapmirror(spec) => Some(spec),
            _ => None,
        }
    }
}

/// One managed resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Stable key of the resource in the state file
    pub address: String,
    /// Connection profile the resource is managed through
    pub cx_profile_name: String,
    #[serde(flatten)]
    pub spec: ResourceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub resources: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(contents)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for entry in &self.resources {
            if entry.address.trim().is_empty() {
                return Err(Error::Configuration("resource address cannot be empty".into()));
            }
            if entry.cx_profile_name.trim().is_empty() {
                return Err(Error::Configuration(format!(
                    "{}: cx_profile_name is required",
                    entry.address
                )));
            }
            if !seen.insert(entry.address.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate resource address '{}'",
                    entry.address
                )));
            }
        }
        Ok(())
    }

    pub fn entry(&self, address: &str) -> Option<&ManifestEntry> {
        self.resources.iter().find(|e| e.address == address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const MANIFEST: &str = r#"
resources:
  - address: svm.main
    cx_profile_name: cluster4
    kind: svm
    name: tfsvm
    max_volumes: "200"
    aggregates: [aggr1]
  - address: snapshot.daily
    cx_profile_name: cluster4
    kind: snapshot
    name: snaptest
    svm: svm1
    volume: v1
    expiry_time: "2030-01-01T00:00:00Z"
  - address: snapmirror.dr
    cx_profile_name: cluster4
    kind: snapmirror
    source:
      path: snap_source_svm:snap
    destination:
      cluster_name: cluster5
      path: snap_dest_svm:snap_dest
    create_destination: true
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = Manifest::from_yaml(MANIFEST).unwrap();
        assert_eq!(manifest.resources.len(), 3);

        let svm = manifest.entry("svm.main").unwrap();
        assert_matches!(&svm.spec, ResourceSpec::Svm(spec) if spec.name == "tfsvm" && !spec.rename);

        let dr = manifest.entry("snapmirror.dr").unwrap();
        assert_eq!(dr.spec.kind(), ResourceKind::Snapmirror);
        let spec = RelationshipSpec::from_spec(&dr.spec).unwrap();
        assert!(spec.initialize);
        assert_eq!(spec.destination.cluster_name.as_deref(), Some("cluster5"));
        assert!(SvmSpec::from_spec(&dr.spec).is_none());
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let yaml = r#"
resources:
  - {address: a, cx_profile_name: c, kind: svm, name: one}
  - {address: a, cx_profile_name: c, kind: svm, name: two}
"#;
        assert_matches!(Manifest::from_yaml(yaml), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let yaml = "resources:\n  - {address: a, cx_profile_name: c, kind: lun, name: x}\n";
        assert_matches!(Manifest::from_yaml(yaml), Err(Error::Yaml(_)));
    }
}
