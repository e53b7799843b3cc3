//! Reconciler
//!
//! Drives a manifest against the tracked state:
//! - apply: delete orphans, then create/update every manifest entry in order
//! - refresh: re-read every tracked resource
//! - destroy: delete every tracked resource, dependents first
//! - import: adopt an existing backend object by identity
//!
//! Each resource is one operation with its own [`OperationContext`]; a
//! failure is recorded in [`Diagnostics`] and the run moves on.

use crate::config::ProviderConfig;
use crate::controller::{
    Created, OperationContext, RelationshipController, ResourceController, SnapshotController,
    SvmController, TransitionOutcome,
};
use crate::domain::ports::{BackendGatewayRef, Identity};
use crate::error::{Error, Result};
use crate::gateway::GatewayFactory;
use crate::manifest::{Manifest, ManifestEntry, ResourceSpec, SpecVariant};
use crate::report::Diagnostics;
use crate::state::{StateFile, TrackedResource};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// =============================================================================
// Outcomes
// =============================================================================

/// What happened to one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Replaced,
    Updated,
    Unchanged,
}

#[derive(Debug)]
struct Applied<O> {
    action: Action,
    id: Identity,
    observed: O,
    transition: Option<TransitionOutcome>,
}

/// Counts of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub refreshed: usize,
    pub imported: usize,
    pub failed: usize,
}

impl ReconcileSummary {
    fn count(&mut self, action: Action) {
        match action {
            Action::Created | Action::Replaced => self.created += 1,
            Action::Updated => self.updated += 1,
            Action::Unchanged => self.unchanged += 1,
        }
    }
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} unchanged, {} deleted, {} refreshed, {} imported, {} failed",
            self.created,
            self.updated,
            self.unchanged,
            self.deleted,
            self.refreshed,
            self.imported,
            self.failed
        )
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Reconciles manifests against storage controllers
pub struct Reconciler {
    config: ProviderConfig,
    /// Per-operation time limit
    operation_timeout: Option<Duration>,
    /// Gateways by connection profile name
    gateways: RwLock<BTreeMap<String, BackendGatewayRef>>,
}

impl Reconciler {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            operation_timeout: None,
            gateways: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Use `gateway` for `profile` instead of building a REST gateway
    pub async fn register_gateway(&self, profile: &str, gateway: BackendGatewayRef) {
        info!("Registering gateway {} for profile {}", gateway.name(), profile);
        self.gateways.write().await.insert(profile.to_string(), gateway);
    }

    async fn gateway(&self, profile: &str) -> Result<BackendGatewayRef> {
        if let Some(gateway) = self.gateways.read().await.get(profile) {
            return Ok(gateway.clone());
        }

        let gateway = GatewayFactory::create(self.config.profile(profile)?)?;
        self.gateways
            .write()
            .await
            .insert(profile.to_string(), gateway.clone());
        Ok(gateway)
    }

    /// Context for one resource operation under the run's cancellation token
    fn operation(&self, run: &OperationContext) -> OperationContext {
        let ctx = OperationContext::new().with_cancellation(run.cancellation_token().clone());
        match self.operation_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    // -------------------------------------------------------------------------
    // Apply
    // -------------------------------------------------------------------------

    /// Bring the backend in line with `manifest`
    pub async fn apply(
        &self,
        run: &OperationContext,
        manifest: &Manifest,
        state: &mut StateFile,
        diagnostics: &mut Diagnostics,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        let orphans: Vec<String> = state
            .destroy_order()
            .into_iter()
            .filter(|address| manifest.entry(address).is_none())
            .collect();
        for address in orphans {
            info!("{} is no longer in the manifest", address);
            self.destroy_one(run, &address, state, diagnostics, &mut summary)
                .await;
        }

        for entry in &manifest.resources {
            if run.cancellation_token().is_cancelled() {
                diagnostics.record(&entry.address, Error::Cancelled("apply interrupted".into()));
                summary.failed += 1;
                continue;
            }

            let ctx = self.operation(run);
            match self.apply_entry(&ctx, entry, state, diagnostics).await {
                Ok(action) => {
                    info!("{}: {:?}", entry.address, action);
                    summary.count(action);
                }
                Err(err) => {
                    if let Some(id) = err.created_id() {
                        warn!("{} was created as {} but is tainted", entry.address, id);
                        state.insert(
                            &entry.address,
                            TrackedResource::tainted(entry, Identity::new(id)),
                        );
                    }
                    diagnostics.record(&entry.address, err);
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    async fn apply_entry(
        &self,
        ctx: &OperationContext,
        entry: &ManifestEntry,
        state: &mut StateFile,
        diagnostics: &mut Diagnostics,
    ) -> Result<Action> {
        let tracked = state.get(&entry.address);
        if let Some(tracked) = tracked {
            if tracked.kind != entry.spec.kind() {
                return Err(Error::validation(
                    "kind",
                    format!(
                        "{} is tracked as {} and cannot become {}; destroy it first",
                        entry.address,
                        tracked.kind,
                        entry.spec.kind()
                    ),
                ));
            }
        }

        let gateway = self.gateway(&entry.cx_profile_name).await?;
        let applied = match &entry.spec {
            ResourceSpec::Svm(desired) => {
                apply_with(&SvmController::new(gateway), ctx, desired, tracked)
                    .await?
                    .into_json()?
            }
            ResourceSpec::Snapshot(desired) => {
                apply_with(&SnapshotController::new(gateway), ctx, desired, tracked)
                    .await?
                    .into_json()?
            }
            ResourceSpec::Snapmirror(desired) => {
                let controller = RelationshipController::new(gateway, self.config.poll);
                apply_with(&controller, ctx, desired, tracked)
                    .await?
                    .into_json()?
            }
        };

        if let Some(TransitionOutcome::TimedOut { waited }) = applied.transition {
            diagnostics.warn(
                &entry.address,
                "transition not observed",
                format!(
                    "{} {} did not leave its initial state within {:?}; run refresh later",
                    entry.spec.kind(),
                    applied.id,
                    waited
                ),
            );
        }

        state.insert(
            &entry.address,
            TrackedResource::new(entry, applied.id, Some(applied.observed)),
        );
        Ok(applied.action)
    }

    // -------------------------------------------------------------------------
    // Refresh
    // -------------------------------------------------------------------------

    /// Re-read every tracked resource; vanished objects leave the state
    pub async fn refresh(
        &self,
        run: &OperationContext,
        state: &mut StateFile,
        diagnostics: &mut Diagnostics,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let addresses: Vec<String> = state.resources.keys().cloned().collect();

        for address in addresses {
            let Some(tracked) = state.get(&address).cloned() else {
                continue;
            };
            let ctx = self.operation(run);
            match self.read_tracked(&ctx, &tracked).await {
                Ok(Some(observed)) => {
                    debug!("{} refreshed", address);
                    let mut refreshed = tracked;
                    refreshed.observed = Some(observed);
                    refreshed.updated_at = chrono::Utc::now();
                    state.insert(&address, refreshed);
                    summary.refreshed += 1;
                }
                Ok(None) => {
                    warn!("{} ({}) no longer exists; dropping it", address, tracked.id);
                    state.remove(&address);
                    summary.deleted += 1;
                }
                Err(err) => {
                    diagnostics.record(&address, err);
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    async fn read_tracked(
        &self,
        ctx: &OperationContext,
        tracked: &TrackedResource,
    ) -> Result<Option<serde_json::Value>> {
        let gateway = self.gateway(&tracked.cx_profile_name).await?;
        let observed = match &tracked.spec {
            ResourceSpec::Svm(desired) => {
                let controller = SvmController::new(gateway);
                to_json(controller.read(ctx, desired, &tracked.id).await?)?
            }
            ResourceSpec::Snapshot(desired) => {
                let controller = SnapshotController::new(gateway);
                to_json(controller.read(ctx, desired, &tracked.id).await?)?
            }
            ResourceSpec::Snapmirror(desired) => {
                let controller = RelationshipController::new(gateway, self.config.poll);
                to_json(controller.read(ctx, desired, &tracked.id).await?)?
            }
        };
        Ok(observed)
    }

    // -------------------------------------------------------------------------
    // Destroy
    // -------------------------------------------------------------------------

    /// Delete every tracked resource, dependents first
    pub async fn destroy(
        &self,
        run: &OperationContext,
        state: &mut StateFile,
        diagnostics: &mut Diagnostics,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for address in state.destroy_order() {
            self.destroy_one(run, &address, state, diagnostics, &mut summary)
                .await;
        }
        summary
    }

    async fn destroy_one(
        &self,
        run: &OperationContext,
        address: &str,
        state: &mut StateFile,
        diagnostics: &mut Diagnostics,
        summary: &mut ReconcileSummary,
    ) {
        let Some(tracked) = state.get(address).cloned() else {
            return;
        };
        let ctx = self.operation(run);
        match self.delete_tracked(&ctx, &tracked).await {
            Ok(()) => {
                info!("{}: deleted {}", address, tracked.id);
                state.remove(address);
                summary.deleted += 1;
            }
            Err(err) => {
                diagnostics.record(address, err);
                summary.failed += 1;
            }
        }
    }

    async fn delete_tracked(&self, ctx: &OperationContext, tracked: &TrackedResource) -> Result<()> {
        let gateway = self.gateway(&tracked.cx_profile_name).await?;
        match &tracked.spec {
            ResourceSpec::Svm(desired) => {
                SvmController::new(gateway)
                    .delete(ctx, desired, &tracked.id)
                    .await
            }
            ResourceSpec::Snapshot(desired) => {
                SnapshotController::new(gateway)
                    .delete(ctx, desired, &tracked.id)
                    .await
            }
            ResourceSpec::Snapmirror(desired) => {
                RelationshipController::new(gateway, self.config.poll)
                    .delete(ctx, desired, &tracked.id)
                    .await
            }
        }
    }

    // -------------------------------------------------------------------------
    // Import
    // -------------------------------------------------------------------------

    /// Adopt the backend object `id` as the resource at `entry.address`
    pub async fn import(
        &self,
        run: &OperationContext,
        entry: &ManifestEntry,
        id: Identity,
        state: &mut StateFile,
    ) -> Result<()> {
        if let Some(existing) = state.get(&entry.address) {
            return Err(Error::InvalidState(format!(
                "{} is already tracked as {}",
                entry.address, existing.id
            )));
        }

        let ctx = self.operation(run);
        let gateway = self.gateway(&entry.cx_profile_name).await?;
        let observed = match &entry.spec {
            ResourceSpec::Svm(desired) => {
                serde_json::to_value(SvmController::new(gateway).import(&ctx, desired, &id).await?)?
            }
            ResourceSpec::Snapshot(desired) => serde_json::to_value(
                SnapshotController::new(gateway)
                    .import(&ctx, desired, &id)
                    .await?,
            )?,
            ResourceSpec::Snapmirror(desired) => serde_json::to_value(
                RelationshipController::new(gateway, self.config.poll)
                    .import(&ctx, desired, &id)
                    .await?,
            )?,
        };

        info!("Imported {} as {}", id, entry.address);
        state.insert(&entry.address, TrackedResource::new(entry, id, Some(observed)));
        Ok(())
    }
}

// =============================================================================
// Generic Steps
// =============================================================================

impl<O: Serialize> Applied<O> {
    fn into_json(self) -> Result<Applied<serde_json::Value>> {
        Ok(Applied {
            action: self.action,
            id: self.id,
            observed: serde_json::to_value(&self.observed)?,
            transition: self.transition,
        })
    }
}

fn to_json<O: Serialize>(observed: Option<O>) -> Result<Option<serde_json::Value>> {
    observed
        .map(|o| serde_json::to_value(&o))
        .transpose()
        .map_err(Error::from)
}

fn created<O>(action: Action, created: Created<O>) -> Applied<O> {
    Applied {
        action,
        id: created.id,
        observed: created.observed,
        transition: created.transition,
    }
}

/// Create, update or keep one resource.
///
/// Tainted resources are deleted and created again. Update runs only when
/// the observed state differs from `desired` in a field the caller controls.
async fn apply_with<C>(
    controller: &C,
    ctx: &OperationContext,
    desired: &C::Desired,
    tracked: Option<&TrackedResource>,
) -> Result<Applied<C::Observed>>
where
    C: ResourceController,
    C::Desired: SpecVariant,
{
    let Some(tracked) = tracked else {
        return Ok(created(Action::Created, controller.create(ctx, desired).await?));
    };
    // Scope for reads and deletes is what the object was created with
    let scope = <C::Desired as SpecVariant>::from_spec(&tracked.spec).unwrap_or(desired);

    if tracked.tainted {
        info!("Replacing tainted {} {}", controller.policy().kind, tracked.id);
        match controller.delete(ctx, scope, &tracked.id).await {
            Ok(()) | Err(Error::Backend { status: 404, .. }) => {}
            Err(err) => return Err(err),
        }
        return Ok(created(Action::Replaced, controller.create(ctx, desired).await?));
    }

    let Some(observed) = controller.read(ctx, scope, &tracked.id).await? else {
        warn!(
            "{} {} disappeared from the backend; creating it again",
            controller.policy().kind,
            tracked.id
        );
        return Ok(created(Action::Created, controller.create(ctx, desired).await?));
    };

    if !controller.has_changes(&observed, desired) && !controller.settings_changed(scope, desired) {
        return Ok(Applied {
            action: Action::Unchanged,
            id: tracked.id.clone(),
            observed,
            transition: None,
        });
    }

    controller.update(ctx, &tracked.id, &observed, desired).await?;
    let observed = controller
        .read(ctx, desired, &tracked.id)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: controller.policy().kind.to_string(),
            name: tracked.id.to_string(),
        })?;
    Ok(Applied {
        action: Action::Updated,
        id: tracked.id.clone(),
        observed,
        transition: None,
    })
}
