//! SVM Controller

use super::context::OperationContext;
use super::policy::{KindPolicy, SVM_POLICY};
use super::{after_create, required_field, Created, ResourceController};
use crate::domain::ports::{
    lookup, lookup_str, name_object, BackendGatewayRef, Identity, Query, Record, ResourceKind,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

const PATH: &str = "svm/svms";
const FIELDS: &[&str] = &[
    "uuid",
    "name",
    "ipspace",
    "snapshot_policy",
    "subtype",
    "comment",
    "language",
    "max_volumes",
    "aggregates",
];

/// Desired SVM
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvmSpec {
    pub name: String,
    /// Allow a change of `name` to rename the SVM
    #[serde(default)]
    pub rename: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Integer or `unlimited`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_volumes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregates: Vec<String>,
}

impl SvmSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("name", "svm name cannot be empty"));
        }
        if let Some(max_volumes) = &self.max_volumes {
            validate_int_or(max_volumes, "unlimited")
                .map_err(|reason| Error::validation("max_volumes", reason))?;
        }
        Ok(())
    }
}

/// SVM as observed on the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvmStatus {
    pub id: Identity,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_volumes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregates: Vec<String>,
}

/// Accept an integer in canonical form or the literal `keyword`
pub fn validate_int_or(value: &str, keyword: &str) -> std::result::Result<(), String> {
    if value.is_empty() || value == keyword {
        return Ok(());
    }
    match value.parse::<i64>() {
        Ok(n) if n.to_string() == value => Ok(()),
        _ => Err(format!(
            "expecting int value or '{}', got: {}",
            keyword, value
        )),
    }
}

#[allow(clippy::too_many_arguments)]
fn svm_record(
    name: &str,
    ipspace: Option<&str>,
    snapshot_policy: Option<&str>,
    subtype: Option<&str>,
    comment: Option<&str>,
    language: Option<&str>,
    max_volumes: Option<&str>,
    aggregates: &[String],
) -> Record {
    let mut record = Record::new();
    record.insert("name".into(), json!(name));
    if let Some(ipspace) = ipspace {
        record.insert("ipspace".into(), name_object(ipspace));
    }
    if let Some(policy) = snapshot_policy {
        record.insert("snapshot_policy".into(), name_object(policy));
    }
    for (field, value) in [
        ("subtype", subtype),
        ("comment", comment),
        ("language", language),
        ("max_volumes", max_volumes),
    ] {
        if let Some(value) = value {
            record.insert(field.into(), json!(value));
        }
    }
    if !aggregates.is_empty() {
        let aggregates: Vec<Value> = aggregates.iter().map(|a| name_object(a)).collect();
        record.insert("aggregates".into(), Value::Array(aggregates));
    }
    record
}

/// Controller for SVMs
pub struct SvmController {
    gateway: BackendGatewayRef,
}

impl SvmController {
    pub fn new(gateway: BackendGatewayRef) -> Self {
        Self { gateway }
    }

    fn item_path(id: &Identity) -> String {
        format!("{}/{}", PATH, id)
    }

    fn parse(id: &Identity, path: &str, record: &Record) -> Result<SvmStatus> {
        let text = |field: &str| lookup_str(record, field).map(str::to_string);
        let max_volumes = match record.get("max_volumes") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let aggregates = lookup(record, "aggregates")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|a| a.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(SvmStatus {
            id: Identity::from_record(record).unwrap_or_else(|| id.clone()),
            name: required_field(ResourceKind::Svm, path, record, "name")?,
            ipspace: text("ipspace.name"),
            snapshot_policy: text("snapshot_policy.name"),
            subtype: text("subtype"),
            comment: text("comment"),
            language: text("language"),
            max_volumes,
            aggregates,
        })
    }

    async fn read_by_id(&self, ctx: &OperationContext, id: &Identity) -> Result<Option<SvmStatus>> {
        let path = Self::item_path(id);
        let query = Query::new().fields(FIELDS);
        let record = ctx.guard("read", self.gateway.get(&path, &query)).await?;
        record.map(|r| Self::parse(id, &path, &r)).transpose()
    }
}

#[async_trait]
impl ResourceController for SvmController {
    type Desired = SvmSpec;
    type Observed = SvmStatus;

    fn policy(&self) -> &'static KindPolicy {
        &SVM_POLICY
    }

    fn desired_record(&self, desired: &SvmSpec) -> Record {
        svm_record(
            &desired.name,
            desired.ipspace.as_deref(),
            desired.snapshot_policy.as_deref(),
            desired.subtype.as_deref(),
            desired.comment.as_deref(),
            desired.language.as_deref(),
            desired.max_volumes.as_deref(),
            &desired.aggregates,
        )
    }

    fn observed_record(&self, observed: &SvmStatus) -> Record {
        svm_record(
            &observed.name,
            observed.ipspace.as_deref(),
            observed.snapshot_policy.as_deref(),
            observed.subtype.as_deref(),
            observed.comment.as_deref(),
            observed.language.as_deref(),
            observed.max_volumes.as_deref(),
            &observed.aggregates,
        )
    }

    fn rename_requested(&self, desired: &SvmSpec) -> bool {
        desired.rename
    }

    async fn create(&self, ctx: &OperationContext, desired: &SvmSpec) -> Result<Created<SvmStatus>> {
        desired.validate()?;

        let body = self.policy().create_payload(&self.desired_record(desired));
        info!("Creating svm {}", desired.name);
        debug!("create svm body: {:?}", body);

        let query = Query::new().return_records();
        let response = ctx
            .guard("create", self.gateway.create(PATH, &query, &body))
            .await?;
        let id = response.first_identity().ok_or_else(|| {
            Error::backend("POST", PATH, 201, "create returned no record with a uuid")
        })?;
        info!("Created svm {} ({})", desired.name, id);

        let observed = self
            .read_by_id(ctx, &id)
            .await
            .and_then(|observed| {
                observed.ok_or_else(|| Error::NotFound {
                    kind: ResourceKind::Svm.to_string(),
                    name: desired.name.clone(),
                })
            })
            .map_err(|e| after_create(ResourceKind::Svm, &id, e))?;

        Ok(Created {
            id,
            observed,
            transition: None,
        })
    }

    async fn read(
        &self,
        ctx: &OperationContext,
        _desired: &SvmSpec,
        id: &Identity,
    ) -> Result<Option<SvmStatus>> {
        id.require(ResourceKind::Svm, "read")?;
        self.read_by_id(ctx, id).await
    }

    async fn update(
        &self,
        ctx: &OperationContext,
        id: &Identity,
        prior: &SvmStatus,
        desired: &SvmSpec,
    ) -> Result<()> {
        id.require(ResourceKind::Svm, "update")?;
        desired.validate()?;

        let changes = self.policy().plan_update(
            &self.observed_record(prior),
            &self.desired_record(desired),
            desired.rename,
        )?;
        if changes.is_empty() {
            debug!("Svm {} has no changes", id);
            return Ok(());
        }

        if changes.contains_key("name") {
            info!("Renaming svm {} to {}", prior.name, desired.name);
        }
        info!("Updating svm {}: {:?}", id, changes.keys().collect::<Vec<_>>());
        let path = Self::item_path(id);
        let query = Query::new().return_records();
        ctx.guard("update", self.gateway.update(&path, &query, &changes))
            .await?;
        Ok(())
    }

    async fn delete(&self, ctx: &OperationContext, desired: &SvmSpec, id: &Identity) -> Result<()> {
        id.require(ResourceKind::Svm, "delete")?;
        info!("Deleting svm {} ({})", desired.name, id);
        let path = Self::item_path(id);
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

    fn setup() -> (Arc<MemoryGateway>, SvmController) {
        let gateway = Arc::new(MemoryGateway::new());
        let controller = SvmController::new(gateway.clone());
        (gateway, controller)
    }

    fn spec() -> SvmSpec {
        SvmSpec {
            name: "tfsvm".into(),
            comment: Some("managed".into()),
            max_volumes: Some("200".into()),
            aggregates: vec!["aggr1".into(), "aggr2".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_int_or() {
        assert!(validate_int_or("unlimited", "unlimited").is_ok());
        assert!(validate_int_or("12", "unlimited").is_ok());
        assert!(validate_int_or("", "unlimited").is_ok());
        assert!(validate_int_or("012", "unlimited").is_err());
        assert!(validate_int_or("lots", "unlimited").is_err());
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let (gateway, controller) = setup();
        let ctx = OperationContext::new();
        let desired = spec();

        let created = controller.create(&ctx, &desired).await.unwrap();
        let read = controller.read(&ctx, &desired, &created.id).await.unwrap().unwrap();
        assert_eq!(read.id, created.id);
        assert_eq!(read.name, "tfsvm");
        assert_eq!(read.aggregates, vec!["aggr1", "aggr2"]);
        assert_eq!(read.ipspace.as_deref(), Some("Default"));
        assert!(!controller.has_changes(&read, &desired));

        let record = gateway.svm_record(&created.id).unwrap();
        assert_eq!(record["aggregates"], json!([{"name": "aggr1"}, {"name": "aggr2"}]));
    }

    #[tokio::test]
    async fn test_invalid_max_volumes_rejected_before_any_call() {
        let (gateway, controller) = setup();
        let mut desired = spec();
        desired.max_volumes = Some("lots".into());
        let err = controller
            .create(&OperationContext::new(), &desired)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation { ref field, .. } if field == "max_volumes");
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_name_change_requires_rename_flag() {
        let (gateway, controller) = setup();
        let ctx = OperationContext::new();
        let created = controller.create(&ctx, &spec()).await.unwrap();
        gateway.clear_calls();

        let mut desired = spec();
        desired.name = "tfsvm2".into();
        desired.comment = Some("changed".into());
        controller
            .update(&ctx, &created.id, &created.observed, &desired)
            .await
            .unwrap();
        let body = gateway.calls()[0].body.clone().unwrap();
        assert_eq!(Value::Object(body), json!({"comment": "changed"}));
        let record = gateway.svm_record(&created.id).unwrap();
        assert_eq!(lookup_str(&record, "name"), Some("tfsvm"));

        desired.rename = true;
        gateway.clear_calls();
        controller
            .update(&ctx, &created.id, &created.observed, &desired)
            .await
            .unwrap();
        let body = gateway.calls()[0].body.clone().unwrap();
        assert_eq!(Value::Object(body), json!({"name": "tfsvm2", "comment": "changed"}));
        let record = gateway.svm_record(&created.id).unwrap();
        assert_eq!(lookup_str(&record, "name"), Some("tfsvm2"));
    }

    #[tokio::test]
    async fn test_clearing_comment_is_rejected_without_patch() {
        let (gateway, controller) = setup();
        let ctx = OperationContext::new();
        let created = controller.create(&ctx, &spec()).await.unwrap();

        let mut desired = spec();
        desired.comment = Some(String::new());
        assert!(controller.has_changes(&created.observed, &desired));
        let err = controller
            .update(&ctx, &created.id, &created.observed, &desired)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation { ref field, .. } if field == "comment");
        assert_eq!(gateway.count(CallMethod::Update), 0);
        let record = gateway.svm_record(&created.id).unwrap();
        assert_eq!(lookup_str(&record, "comment"), Some("managed"));
    }

    #[tokio::test]
    async fn test_ipspace_change_is_rejected() {
        let (gateway, controller) = setup();
        let ctx = OperationContext::new();
        let created = controller.create(&ctx, &spec()).await.unwrap();

        let mut desired = spec();
        desired.ipspace = Some("other".into());
        let err = controller
            .update(&ctx, &created.id, &created.observed, &desired)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation { ref field, .. } if field == "ipspace");
        assert_eq!(gateway.count(CallMethod::Update), 0);
    }

    #[tokio::test]
    async fn test_delete_and_import() {
        let (gateway, controller) = setup();
        let ctx = OperationContext::new();
        let existing = gateway.add_svm("existing");

        let imported = controller
            .import(&ctx, &SvmSpec::new("existing"), &existing)
            .await
            .unwrap();
        assert_eq!(imported.name, "existing");

        let err = controller
            .delete(&ctx, &SvmSpec::new("existing"), &Identity::new(" "))
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidState(_));
        assert_eq!(gateway.count(CallMethod::Delete), 0);

        controller
            .delete(&ctx, &SvmSpec::new("existing"), &existing)
            .await
            .unwrap();
        assert!(gateway.svm_record(&existing).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_is_backend_error() {
        let (gateway, controller) = setup();
        gateway.add_svm("tfsvm");
        let err = controller
            .create(&OperationContext::new(), &spec())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Backend { status: 409, .. });
        assert!(err.created_id().is_none());
    }
}
