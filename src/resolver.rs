//! Reference Resolver
//!
//! The controller API is id-addressed; manifests use names. This module maps
//! a display name to the backend identifier by listing within the right
//! scope. Zero and multiple matches are both errors: the resolver never
//! guesses.

use crate::controller::context::OperationContext;
use crate::domain::ports::{BackendGateway, Identity, NameReference, Query, ResourceKind};
use crate::error::{Error, Result};
use tracing::debug;

/// Resolves names to identifiers through a gateway
pub struct ReferenceResolver<'a> {
    gateway: &'a dyn BackendGateway,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(gateway: &'a dyn BackendGateway) -> Self {
        Self { gateway }
    }

    /// Resolve `name` of `kind` to its identifier.
    ///
    /// Volumes are scoped to an SVM and need the SVM's id as `scope`.
    pub async fn resolve(
        &self,
        ctx: &OperationContext,
        kind: ResourceKind,
        name: &str,
        scope: Option<&Identity>,
    ) -> Result<Identity> {
        if name.trim().is_empty() {
            return Err(Error::validation(
                format!("{}.name", kind),
                "name reference cannot be empty",
            ));
        }

        let (path, query) = match (kind, scope) {
            (ResourceKind::Svm, _) => ("svm/svms", Query::new().add("name", name)),
            (ResourceKind::Volume, Some(svm)) => (
                "storage/volumes",
                Query::new().add("name", name).add("svm.uuid", svm.as_str()),
            ),
            (ResourceKind::Volume, None) => {
                return Err(Error::InvalidState(format!(
                    "volume '{}' cannot be resolved without its svm",
                    name
                )))
            }
            (other, _) => return Err(Error::unsupported(other.to_string(), "resolve by name")),
        };
        let query = query.fields(&["uuid", "name"]);

        let records = ctx.guard("resolve", self.gateway.list(path, &query)).await?;

        match records.as_slice() {
            [] => Err(Error::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            }),
            [only] => {
                let id = Identity::from_record(only).ok_or_else(|| {
                    Error::backend("GET", path, 200, format!("{} '{}' has no uuid", kind, name))
                })?;
                debug!("Resolved {} '{}' to {}", kind, name, id);
                Ok(id)
            }
            many => Err(Error::Ambiguous {
                kind: kind.to_string(),
                name: name.to_string(),
                count: many.len(),
            }),
        }
    }

    /// Resolve into a [`NameReference`]
    pub async fn reference(
        &self,
        ctx: &OperationContext,
        kind: ResourceKind,
        name: &str,
        scope: Option<&Identity>,
    ) -> Result<NameReference> {
        let id = self.resolve(ctx, kind, name, scope).await?;
        Ok(NameReference::resolved(kind, name, id))
    }

    /// Resolve an SVM and then a volume inside it
    pub async fn volume_in_svm(
        &self,
        ctx: &OperationContext,
        svm: &str,
        volume: &str,
    ) -> Result<(NameReference, NameReference)> {
        let svm = self.reference(ctx, ResourceKind::Svm, svm, None).await?;
        let volume = self
            .reference(ctx, ResourceKind::Volume, volume, Some(svm.id()?))
            .await?;
        Ok((svm, volume))
    }
}
