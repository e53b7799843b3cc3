//! Resource Controllers
//!
//! One controller per managed kind. Each composes the reference resolver,
//! the backend gateway and (for relationships) the transition poller into
//! Create/Read/Update/Delete, and delegates field rules to [`policy`].

pub mod context;
pub mod policy;
pub mod poller;
pub mod relationship;
pub mod snapshot;
pub mod svm;

pub use context::OperationContext;
pub use policy::{FieldPolicy, KindPolicy, Mutability};
pub use poller::{TransitionOutcome, TransitionPoller};
pub use relationship::*;
pub use snapshot::*;
pub use svm::*;

use crate::domain::ports::{Identity, Record, ResourceKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Result of a successful Create
#[derive(Debug, Clone)]
pub struct Created<O> {
    /// Identity assigned by the backend
    pub id: Identity,
    /// State read back after all create steps
    pub observed: O,
    /// Outcome of the post-create transition, for kinds that have one
    pub transition: Option<TransitionOutcome>,
}

/// Lifecycle contract implemented per managed kind.
///
/// `desired` doubles as the scope for kinds addressed under a parent
/// collection (snapshots live under their volume).
#[async_trait]
pub trait ResourceController: Send + Sync {
    type Desired: Send + Sync;
    type Observed: Send + Sync + Serialize + DeserializeOwned;

    /// Mutability table for this kind
    fn policy(&self) -> &'static KindPolicy;

    /// Desired state in the comparable record shape
    fn desired_record(&self, desired: &Self::Desired) -> Record;

    /// Observed state in the comparable record shape
    fn observed_record(&self, observed: &Self::Observed) -> Record;

    /// Whether the caller asked for an explicit rename
    fn rename_requested(&self, _desired: &Self::Desired) -> bool {
        false
    }

    /// Whether Update would have anything to do
    fn has_changes(&self, prior: &Self::Observed, desired: &Self::Desired) -> bool {
        self.policy().has_changes(
            &self.observed_record(prior),
            &self.desired_record(desired),
            self.rename_requested(desired),
        )
    }

    /// Whether a create-time setting the backend never reports back differs
    /// from what the object was created with
    fn settings_changed(&self, _applied: &Self::Desired, _desired: &Self::Desired) -> bool {
        false
    }

    async fn create(
        &self,
        ctx: &OperationContext,
        desired: &Self::Desired,
    ) -> Result<Created<Self::Observed>>;

    /// Read by identity; `None` when the object no longer exists
    async fn read(
        &self,
        ctx: &OperationContext,
        desired: &Self::Desired,
        id: &Identity,
    ) -> Result<Option<Self::Observed>>;

    async fn update(
        &self,
        ctx: &OperationContext,
        id: &Identity,
        prior: &Self::Observed,
        desired: &Self::Desired,
    ) -> Result<()>;

    async fn delete(
        &self,
        ctx: &OperationContext,
        desired: &Self::Desired,
        id: &Identity,
    ) -> Result<()>;

    /// Adopt an existing object by identity
    async fn import(
        &self,
        ctx: &OperationContext,
        desired: &Self::Desired,
        id: &Identity,
    ) -> Result<Self::Observed> {
        let kind = self.policy().kind;
        id.require(kind, "import")?;
        self.read(ctx, desired, id).await?.ok_or_else(|| Error::NotFound {
            kind: kind.to_string(),
            name: id.to_string(),
        })
    }
}

/// Wrap a failure that happened after the backend object was created, so
/// the caller keeps the identity
pub(crate) fn after_create(kind: ResourceKind, id: &Identity, err: Error) -> Error {
    match err {
        err @ Error::PartialCreate { .. } => err,
        err => Error::PartialCreate {
            kind: kind.to_string(),
            id: id.to_string(),
            source: Box::new(err),
        },
    }
}

/// Read a required string field out of a backend record
pub(crate) fn required_field(
    kind: ResourceKind,
    path: &str,
    record: &Record,
    field: &str,
) -> Result<String> {
    crate::domain::ports::lookup_str(record, field)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::backend(
                "GET",
                path,
                200,
                format!("{} record is missing field '{}'", kind, field),
            )
        })
}
