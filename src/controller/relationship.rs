//! Replication Relationship Controller
//!
//! Relationships are immutable once created. Create optionally drives the
//! backend's initialization handshake through the [`TransitionPoller`] and
//! always re-reads `state`/`healthy` afterwards; those two fields are never
//! written by the controller.

use super::context::OperationContext;
use super::policy::{KindPolicy, RELATIONSHIP_POLICY};
use super::poller::{TransitionOutcome, TransitionPoller};
use super::{after_create, required_field, Created, ResourceController};
use crate::config::PollConfig;
use crate::domain::ports::{
    lookup, lookup_str, BackendGatewayRef, Identity, Query, Record, ResourceKind,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const PATH: &str = "snapmirror/relationships";
const FIELDS: &[&str] = &["uuid", "source", "destination", "healthy", "state"];

// =============================================================================
// Model
// =============================================================================

/// One side of a relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    /// `<svm>:<volume>`, or `<svm>:` for a whole-SVM relationship
    pub path: String,
}

impl Endpoint {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            cluster_name: None,
            path: path.into(),
        }
    }

    fn validate(&self, side: &str) -> Result<()> {
        match self.path.split_once(':') {
            Some((svm, _)) if !svm.is_empty() => {}
            _ => {
                return Err(Error::validation(
                    format!("{}.path", side),
                    format!("expected <svm>:<volume>, got '{}'", self.path),
                ))
            }
        }
        if matches!(&self.cluster_name, Some(name) if name.trim().is_empty()) {
            return Err(Error::validation(
                format!("{}.cluster.name", side),
                "cluster name cannot be empty",
            ));
        }
        Ok(())
    }

    fn to_wire(&self) -> Value {
        match &self.cluster_name {
            Some(cluster) => json!({ "path": self.path, "cluster": { "name": cluster } }),
            None => json!({ "path": self.path }),
        }
    }

    fn from_record(record: &Record, side: &str) -> Result<Self> {
        Ok(Self {
            cluster_name: lookup_str(record, &format!("{}.cluster.name", side)).map(str::to_string),
            path: required_field(ResourceKind::Snapmirror, PATH, record, &format!("{}.path", side))?,
        })
    }
}

/// Backend-defined relationship state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationshipState {
    Uninitialized,
    Snapmirrored,
    BrokenOff,
    Paused,
    Synchronizing,
    InSync,
    OutOfSync,
    Other(String),
}

impl RelationshipState {
    pub fn as_str(&self) -> &str {
        match self {
            RelationshipState::Uninitialized => "uninitialized",
            RelationshipState::Snapmirrored => "snapmirrored",
            RelationshipState::BrokenOff => "broken_off",
            RelationshipState::Paused => "paused",
            RelationshipState::Synchronizing => "synchronizing",
            RelationshipState::InSync => "in_sync",
            RelationshipState::OutOfSync => "out_of_sync",
            RelationshipState::Other(s) => s,
        }
    }
}

impl From<String> for RelationshipState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "uninitialized" => RelationshipState::Uninitialized,
            "snapmirrored" => RelationshipState::Snapmirrored,
            "broken_off" => RelationshipState::BrokenOff,
            "paused" => RelationshipState::Paused,
            "synchronizing" => RelationshipState::Synchronizing,
            "in_sync" => RelationshipState::InSync,
            "out_of_sync" => RelationshipState::OutOfSync,
            _ => RelationshipState::Other(s),
        }
    }
}

impl From<RelationshipState> for String {
    fn from(state: RelationshipState) -> Self {
        state.as_str().to_string()
    }
}

impl std::fmt::Display for RelationshipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_initialize() -> bool {
    true
}

/// Desired replication relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipSpec {
    pub source: Endpoint,
    pub destination: Endpoint,
    /// Provision the destination volume as part of create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_destination: Option<bool>,
    /// Initialize the relationship after creating it
    #[serde(default = "default_initialize")]
    pub initialize: bool,
}

/// Relationship as observed on the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipStatus {
    pub id: Identity,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub healthy: bool,
    pub state: RelationshipState,
}

// =============================================================================
// Controller
// =============================================================================

/// Controller for replication relationships
pub struct RelationshipController {
    gateway: BackendGatewayRef,
    poller: TransitionPoller,
}

impl RelationshipController {
    pub fn new(gateway: BackendGatewayRef, poll: PollConfig) -> Self {
        Self {
            gateway,
            poller: TransitionPoller::new(poll),
        }
    }

    fn item_path(id: &Identity) -> String {
        format!("{}/{}", PATH, id)
    }

    fn create_body(spec: &RelationshipSpec) -> Record {
        let mut body = Record::new();
        body.insert("source".into(), spec.source.to_wire());
        body.insert("destination".into(), spec.destination.to_wire());
        if let Some(enabled) = spec.create_destination {
            body.insert("create_destination".into(), json!({ "enabled": enabled }));
        }
        body
    }

    fn parse(id: &Identity, record: &Record) -> Result<RelationshipStatus> {
        let state = required_field(ResourceKind::Snapmirror, PATH, record, "state")?;
        Ok(RelationshipStatus {
            id: Identity::from_record(record).unwrap_or_else(|| id.clone()),
            source: Endpoint::from_record(record, "source")?,
            destination: Endpoint::from_record(record, "destination")?,
            healthy: lookup(record, "healthy")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            state: RelationshipState::from(state),
        })
    }

    /// Read that treats absence as an error
    async fn fetch(&self, ctx: &OperationContext, id: &Identity) -> Result<RelationshipStatus> {
        self.read_by_id(ctx, id).await?.ok_or_else(|| Error::NotFound {
            kind: ResourceKind::Snapmirror.to_string(),
            name: id.to_string(),
        })
    }

    async fn read_by_id(
        &self,
        ctx: &OperationContext,
        id: &Identity,
    ) -> Result<Option<RelationshipStatus>> {
        let path = Self::item_path(id);
        let query = Query::new().fields(FIELDS);
        let record = ctx.guard("read", self.gateway.get(&path, &query)).await?;
        record.map(|r| Self::parse(id, &r)).transpose()
    }

    /// Steps after the POST succeeded: re-read and, if requested, initialize
    async fn finish_create(
        &self,
        ctx: &OperationContext,
        spec: &RelationshipSpec,
        id: &Identity,
    ) -> Result<Created<RelationshipStatus>> {
        let observed = self.fetch(ctx, id).await?;
        debug!("Read snapmirror {} after create: {:?}", id, observed);

        if !(spec.initialize && observed.state == RelationshipState::Uninitialized) {
            return Ok(Created {
                id: id.clone(),
                observed,
                transition: None,
            });
        }

        info!("Initializing snapmirror relationship {}", id);
        let path = Self::item_path(id);
        let mut body = Record::new();
        body.insert(
            "state".into(),
            json!(RelationshipState::Snapmirrored.as_str()),
        );

        let request = async {
            self.gateway
                .update(&path, &Query::new(), &body)
                .await
                .map(|_| ())
        };
        let (observed, outcome) = self
            .poller
            .run(
                ctx,
                request,
                || self.fetch(ctx, id),
                |status: &RelationshipStatus| status.state != RelationshipState::Uninitialized,
            )
            .await?;

        if let TransitionOutcome::TimedOut { waited } = outcome {
            warn!(
                "Snapmirror {} still {} after {:?}; keeping it",
                id, observed.state, waited
            );
        }

        Ok(Created {
            id: id.clone(),
            observed,
            transition: Some(outcome),
        })
    }
}

#[async_trait]
impl ResourceController for RelationshipController {
    type Desired = RelationshipSpec;
    type Observed = RelationshipStatus;

    fn policy(&self) -> &'static KindPolicy {
        &RELATIONSHIP_POLICY
    }

    fn desired_record(&self, desired: &RelationshipSpec) -> Record {
        let mut record = Record::new();
        record.insert("source".into(), desired.source.to_wire());
        record.insert("destination".into(), desired.destination.to_wire());
        if let Some(enabled) = desired.create_destination {
            record.insert("create_destination".into(), json!(enabled));
        }
        record.insert("initialize".into(), json!(desired.initialize));
        record
    }

    fn observed_record(&self, observed: &RelationshipStatus) -> Record {
        let mut record = Record::new();
        record.insert("source".into(), observed.source.to_wire());
        record.insert("destination".into(), observed.destination.to_wire());
        record.insert("state".into(), json!(observed.state.as_str()));
        record.insert("healthy".into(), json!(observed.healthy));
        record
    }

    /// Cluster names reported by the backend but not requested are not drift
    fn has_changes(&self, prior: &RelationshipStatus, desired: &RelationshipSpec) -> bool {
        let differs = |observed: &Endpoint, wanted: &Endpoint| {
            observed.path != wanted.path
                || (wanted.cluster_name.is_some() && observed.cluster_name != wanted.cluster_name)
        };
        differs(&prior.source, &desired.source) || differs(&prior.destination, &desired.destination)
    }

    fn settings_changed(&self, applied: &RelationshipSpec, desired: &RelationshipSpec) -> bool {
        self.policy()
            .create_only_changed(&self.desired_record(applied), &self.desired_record(desired))
    }

    async fn create(
        &self,
        ctx: &OperationContext,
        desired: &RelationshipSpec,
    ) -> Result<Created<RelationshipStatus>> {
        desired.source.validate("source")?;
        desired.destination.validate("destination")?;

        let body = Self::create_body(desired);
        info!(
            "Creating snapmirror relationship {} -> {}",
            desired.source.path, desired.destination.path
        );
        debug!("create snapmirror body: {:?}", body);

        let query = Query::new().return_records();
        let response = ctx
            .guard("create", self.gateway.create(PATH, &query, &body))
            .await?;
        let id = response.first_identity().ok_or_else(|| {
            Error::backend("POST", PATH, 201, "create returned no record with a uuid")
        })?;
        info!("Created snapmirror relationship {}", id);

        self.finish_create(ctx, desired, &id)
            .await
            .map_err(|e| after_create(ResourceKind::Snapmirror, &id, e))
    }

    async fn read(
        &self,
        ctx: &OperationContext,
        _desired: &RelationshipSpec,
        id: &Identity,
    ) -> Result<Option<RelationshipStatus>> {
        id.require(ResourceKind::Snapmirror, "read")?;
        self.read_by_id(ctx, id).await
    }

    /// The backend offers no PATCH for relationship definitions
    async fn update(
        &self,
        _ctx: &OperationContext,
        _id: &Identity,
        _prior: &RelationshipStatus,
        _desired: &RelationshipSpec,
    ) -> Result<()> {
        Err(Error::unsupported(self.policy().kind.to_string(), "update"))
    }

    async fn delete(
        &self,
        ctx: &OperationContext,
        _desired: &RelationshipSpec,
        id: &Identity,
    ) -> Result<()> {
        id.require(ResourceKind::Snapmirror, "delete")?;
        info!("Deleting snapmirror relationship {}", id);
        let path = Self::item_path(id);
        ctx.guard("delete", self.gateway.delete(&path, &Query::new()))
            .await
    }
}
