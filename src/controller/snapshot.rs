//! Volume Snapshot Controller
//!
//! Snapshots are addressed under their volume
//! (`storage/volumes/{volume}/snapshots/{id}`), so every operation resolves
//! the owning SVM and volume from the desired record first.

use super::context::OperationContext;
use super::policy::{KindPolicy, SNAPSHOT_POLICY};
use super::{after_create, required_field, Created, ResourceController};
use crate::domain::ports::{
    lookup_str, BackendGatewayRef, Identity, NameReference, Query, Record, ResourceKind,
};
use crate::error::{Error, Result};
use crate::resolver::ReferenceResolver;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

const FIELDS: &[&str] = &[
    "uuid",
    "name",
    "expiry_time",
    "snaplock_expiry_time",
    "comment",
    "snapmirror_label",
    "create_time",
];

/// Optional fields that may change but never back to empty
const OPTIONAL_FIELDS: [&str; 4] = [
    "expiry_time",
    "snaplock_expiry_time",
    "comment",
    "snapmirror_label",
];

/// Desired volume snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSpec {
    pub name: String,
    /// Name of the owning SVM
    pub svm: String,
    /// Name of the owning volume
    pub volume: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snaplock_expiry_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapmirror_label: Option<String>,
}

impl SnapshotSpec {
    pub fn new(svm: impl Into<String>, volume: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            svm: svm.into(),
            volume: volume.into(),
            expiry_time: None,
            snaplock_expiry_time: None,
            comment: None,
            snapmirror_label: None,
        }
    }

    fn optional(&self, field: &str) -> Option<&str> {
        match field {
            "expiry_time" => self.expiry_time.as_deref(),
            "snaplock_expiry_time" => self.snaplock_expiry_time.as_deref(),
            "comment" => self.comment.as_deref(),
            "snapmirror_label" => self.snapmirror_label.as_deref(),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("name", "snapshot name cannot be empty"));
        }
        for field in ["expiry_time", "snaplock_expiry_time"] {
            if let Some(value) = self.optional(field).filter(|v| !v.is_empty()) {
                DateTime::parse_from_rfc3339(value).map_err(|e| {
                    Error::validation(field, format!("'{}' is not an RFC 3339 timestamp: {}", value, e))
                })?;
            }
        }
        Ok(())
    }
}

/// Volume snapshot as observed on the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStatus {
    pub id: Identity,
    pub name: String,
    pub svm: NameReference,
    pub volume: NameReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snaplock_expiry_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapmirror_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
}

/// Timestamps compare by instant, not by spelling
fn normalize_time(value: &str) -> String {
    match DateTime::parse_from_rfc3339(value) {
        Ok(time) => time
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        Err(_) => value.to_string(),
    }
}

fn comparable(name: &str, svm: &str, volume: &str, optional: impl Fn(&str) -> Option<String>) -> Record {
    let mut record = Record::new();
    record.insert("name".into(), json!(name));
    record.insert("svm".into(), json!(svm));
    record.insert("volume".into(), json!(volume));
    for field in OPTIONAL_FIELDS {
        if let Some(value) = optional(field) {
            let value = if field.ends_with("expiry_time") {
                normalize_time(&value)
            } else {
                value
            };
            record.insert(field.into(), json!(value));
        }
    }
    record
}

/// Controller for volume snapshots
pub struct SnapshotController {
    gateway: BackendGatewayRef,
}

impl SnapshotController {
    pub fn new(gateway: BackendGatewayRef) -> Self {
        Self { gateway }
    }

    fn collection_path(volume: &Identity) -> String {
        format!("storage/volumes/{}/snapshots", volume)
    }

    fn item_path(volume: &Identity, id: &Identity) -> String {
        format!("storage/volumes/{}/snapshots/{}", volume, id)
    }

    /// Resolve the owning SVM and volume by name
    async fn owners(
        &self,
        ctx: &OperationContext,
        desired: &SnapshotSpec,
    ) -> Result<(NameReference, NameReference)> {
        ReferenceResolver::new(self.gateway.as_ref())
            .volume_in_svm(ctx, &desired.svm, &desired.volume)
            .await
    }

    /// Like [`owners`](Self::owners), but `None` when the SVM or volume is
    /// gone, which takes every snapshot under it along
    async fn existing_owners(
        &self,
        ctx: &OperationContext,
        desired: &SnapshotSpec,
    ) -> Result<Option<(NameReference, NameReference)>> {
        match self.owners(ctx, desired).await {
            Ok(owners) => Ok(Some(owners)),
            Err(Error::NotFound { kind, name }) => {
                debug!("Owning {} '{}' of snapshot {} is gone", kind, name, desired.name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn read_in(
        &self,
        ctx: &OperationContext,
        svm: &NameReference,
        volume: &NameReference,
        id: &Identity,
    ) -> Result<Option<SnapshotStatus>> {
        let path = Self::item_path(volume.id()?, id);
        let query = Query::new().fields(FIELDS);
        let Some(record) = ctx.guard("read", self.gateway.get(&path, &query)).await? else {
            return Ok(None);
        };

        let text = |field: &str| lookup_str(&record, field).map(str::to_string);
        Ok(Some(SnapshotStatus {
            id: Identity::from_record(&record).unwrap_or_else(|| id.clone()),
            name: required_field(ResourceKind::Snapshot, &path, &record, "name")?,
            svm: svm.clone(),
            volume: volume.clone(),
            expiry_time: text("expiry_time"),
            snaplock_expiry_time: text("snaplock_expiry_time"),
            comment: text("comment"),
            snapmirror_label: text("snapmirror_label"),
            create_time: text("create_time"),
        }))
    }
}

#[async_trait]
impl ResourceController for SnapshotController {
    type Desired = SnapshotSpec;
    type Observed = SnapshotStatus;

    fn policy(&self) -> &'static KindPolicy {
        &SNAPSHOT_POLICY
    }

    fn desired_record(&self, desired: &SnapshotSpec) -> Record {
        comparable(&desired.name, &desired.svm, &desired.volume, |field| {
            desired.optional(field).map(str::to_string)
        })
    }

    fn observed_record(&self, observed: &SnapshotStatus) -> Record {
        comparable(
            &observed.name,
            &observed.svm.name,
            &observed.volume.name,
            |field| match field {
                "expiry_time" => observed.expiry_time.clone(),
                "snaplock_expiry_time" => observed.snaplock_expiry_time.clone(),
                "comment" => observed.comment.clone(),
                "snapmirror_label" => observed.snapmirror_label.clone(),
                _ => None,
            },
        )
    }

    async fn create(
        &self,
        ctx: &OperationContext,
        desired: &SnapshotSpec,
    ) -> Result<Created<SnapshotStatus>> {
        desired.validate()?;
        let (svm, volume) = self.owners(ctx, desired).await?;

        let body = self.policy().create_payload(&self.desired_record(desired));
        let path = Self::collection_path(volume.id()?);
        info!(
            "Creating snapshot {} on {}:{}",
            desired.name, desired.svm, desired.volume
        );
        debug!("create snapshot body: {:?}", body);

        let query = Query::new().return_records();
        let response = ctx
            .guard("create", self.gateway.create(&path, &query, &body))
            .await?;
        let id = response.first_identity().ok_or_else(|| {
            Error::backend("POST", path.as_str(), 201, "create returned no record with a uuid")
        })?;
        info!("Created snapshot {} ({})", desired.name, id);

        let observed = self
            .read_in(ctx, &svm, &volume, &id)
            .await
            .and_then(|observed| {
                observed.ok_or_else(|| Error::NotFound {
                    kind: ResourceKind::Snapshot.to_string(),
                    name: id.to_string(),
                })
            })
            .map_err(|e| after_create(ResourceKind::Snapshot, &id, e))?;

        Ok(Created {
            id,
            observed,
            transition: None,
        })
    }

    async fn read(
        &self,
        ctx: &OperationContext,
        desired: &SnapshotSpec,
        id: &Identity,
    ) -> Result<Option<SnapshotStatus>> {
        id.require(ResourceKind::Snapshot, "read")?;
        match self.existing_owners(ctx, desired).await? {
            Some((svm, volume)) => self.read_in(ctx, &svm, &volume, id).await,
            None => Ok(None),
        }
    }

    async fn update(
        &self,
        ctx: &OperationContext,
        id: &Identity,
        prior: &SnapshotStatus,
        desired: &SnapshotSpec,
    ) -> Result<()> {
        id.require(ResourceKind::Snapshot, "update")?;
        desired.validate()?;

        let changes = self.policy().plan_update(
            &self.observed_record(prior),
            &self.desired_record(desired),
            false,
        )?;
        if changes.is_empty() {
            debug!("Snapshot {} has no changes", id);
            return Ok(());
        }

        let volume = match prior.volume.id.clone() {
            Some(volume) => volume,
            None => self.owners(ctx, desired).await?.1.id()?.clone(),
        };
        let path = Self::item_path(&volume, id);
        info!("Updating snapshot {}: {:?}", id, changes.keys().collect::<Vec<_>>());
        ctx.guard("update", self.gateway.update(&path, &Query::new(), &changes))
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &OperationContext,
        desired: &SnapshotSpec,
        id: &Identity,
    ) -> Result<()> {
        id.require(ResourceKind::Snapshot, "delete")?;
        let Some((_, volume)) = self.existing_owners(ctx, desired).await? else {
            info!("Snapshot {} ({}) is already gone with its volume", desired.name, id);
            return Ok(());
        };
        let path = Self::item_path(volume.id()?, id);
        info!("Deleting snapshot {} ({})", desired.name, id);
        ctx.guard("delete", self.gateway.delete(&path, &Query::new()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CallMethod, MemoryGateway};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryGateway>, SnapshotController) {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.add_volume("svm1", "v1");
        let controller = SnapshotController::new(gateway.clone());
        (gateway, controller)
    }

    fn spec(name: &str) -> SnapshotSpec {
        let mut spec = SnapshotSpec::new("svm1", "v1", name);
        spec.expiry_time = Some("2030-01-01T00:00:00Z".into());
        spec
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let (gateway, controller) = setup();
        let ctx = OperationContext::new();
        let desired = spec("snaptest");

        let created = controller.create(&ctx, &desired).await.unwrap();
        assert!(!created.id.is_empty());
        assert!(created.transition.is_none());

        let read = controller.read(&ctx, &desired, &created.id).await.unwrap().unwrap();
        assert_eq!(read.name, "snaptest");
        assert_eq!(read.id, created.id);
        assert_eq!(read.expiry_time.as_deref(), Some("2030-01-01T00:00:00Z"));
        assert!(!controller.has_changes(&read, &desired));

        let post = gateway
            .calls()
            .into_iter()
            .find(|c| c.method == CallMethod::Create)
            .unwrap();
        assert_eq!(post.query.get("return_records"), Some("true"));
        let body = post.body.unwrap();
        assert!(!body.contains_key("svm"));
        assert!(!body.contains_key("comment"));
    }

    #[tokio::test]
    async fn test_missing_volume_is_not_found() {
        let (gateway, controller) = setup();
        let err = controller
            .create(&OperationContext::new(), &SnapshotSpec::new("svm1", "missing", "s"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::NotFound { ref kind, .. } if kind == "volume");
        assert_eq!(gateway.count(CallMethod::Create), 0);
    }

    #[tokio::test]
    async fn test_clearing_optional_field_is_rejected_without_patch() {
        let (gateway, controller) = setup();
        let ctx = OperationContext::new();
        let mut desired = spec("snap1");
        desired.comment = Some("keep".into());
        let created = controller.create(&ctx, &desired).await.unwrap();

        for clear in [Some(String::new()), None] {
            let mut cleared = desired.clone();
            cleared.comment = clear;
            let err = controller
                .update(&ctx, &created.id, &created.observed, &cleared)
                .await
                .unwrap_err();
            assert_matches!(err, Error::Validation { ref field, .. } if field == "comment");
        }
        assert_eq!(gateway.count(CallMethod::Update), 0);
    }

    #[tokio::test]
    async fn test_rename_sends_only_name() {
        let (gateway, controller) = setup();
        let ctx = OperationContext::new();
        let created = controller.create(&ctx, &spec("snap1")).await.unwrap();
        gateway.clear_calls();

        let mut renamed = spec("snap2");
        renamed.expiry_time = Some("2030-01-01T00:00:00+00:00".into());
        assert!(controller.has_changes(&created.observed, &renamed));
        controller
            .update(&ctx, &created.id, &created.observed, &renamed)
            .await
            .unwrap();

        let calls = gateway.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].body.as_ref().unwrap().keys().collect::<Vec<_>>(), vec!["name"]);
        let record = gateway.snapshot_record(&created.id).unwrap();
        assert_eq!(lookup_str(&record, "name"), Some("snap2"));
    }

    #[tokio::test]
    async fn test_noop_update_sends_nothing() {
        let (gateway, controller) = setup();
        let ctx = OperationContext::new();
        let desired = spec("snap1");
        let created = controller.create(&ctx, &desired).await.unwrap();
        gateway.clear_calls();

        controller
            .update(&ctx, &created.id, &created.observed, &desired)
            .await
            .unwrap();
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_timestamp_rejected_before_any_call() {
        let (gateway, controller) = setup();
        let mut desired = spec("snap1");
        desired.snaplock_expiry_time = Some("next tuesday".into());
        let err = controller
            .create(&OperationContext::new(), &desired)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation { ref field, .. } if field == "snaplock_expiry_time");
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let (gateway, controller) = setup();
        let ctx = OperationContext::new();
        let desired = spec("snap1");

        let err = controller
            .delete(&ctx, &desired, &Identity::new(""))
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidState(_));
        assert!(gateway.calls().is_empty());

        let created = controller.create(&ctx, &desired).await.unwrap();
        controller.delete(&ctx, &desired, &created.id).await.unwrap();
        assert_eq!(gateway.snapshot_count(), 0);
        assert!(controller.read(&ctx, &desired, &created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_import_unknown_id_is_not_found() {
        let (_gateway, controller) = setup();
        let err = controller
            .import(&OperationContext::new(), &spec("snap1"), &Identity::new("snap-unknown"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::NotFound { .. });
    }
}
