//! Storage Reconciler - Declarative Lifecycle Management for Storage Controllers
//!
//! Reconciles SVMs, volume snapshots and replication relationships on a
//! storage controller's REST API against a desired-state manifest.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                  Reconciler (apply/refresh/destroy)           │
//! │         manifest ──► per-resource operation ──► state file    │
//! ├───────────────────────────────────────────────────────────────┤
//! │                      Resource Controllers                     │
//! │  ┌────────────┐  ┌──────────────┐  ┌───────────────────────┐  │
//! │  │    SVM     │  │   Snapshot   │  │ Relationship + Poller │  │
//! │  └─────┬──────┘  └──────┬───────┘  └───────────┬───────────┘  │
//! │        │   Mutability Policy │ Reference Resolver │           │
//! │        └────────────────┼────────────────────────┘            │
//! ├─────────────────────────┴─────────────────────────────────────┤
//! │             Backend Gateway (REST / in-memory)                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: per-kind controllers, mutability policy, transition poller
//! - [`resolver`]: name to identifier resolution
//! - [`gateway`]: REST and in-memory backend gateways
//! - [`reconciler`]: manifest-driven apply, refresh, destroy and import
//! - [`domain`]: core types and the gateway port
//! - [`error`]: error taxonomy, [`report`]: diagnostics

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod manifest;
pub mod reconciler;
pub mod report;
pub mod resolver;
pub mod state;

// Re-export commonly used types
pub use config::{ConnectionProfile, PollConfig, ProviderConfig};

pub use controller::{
    Created, Endpoint, OperationContext, RelationshipController, RelationshipSpec,
    RelationshipState, RelationshipStatus, ResourceController, SnapshotController, SnapshotSpec,
    SnapshotStatus, SvmController, SvmSpec, SvmStatus, TransitionOutcome, TransitionPoller,
};

pub use domain::ports::{
    BackendGateway, BackendGatewayRef, Identity, NameReference, Query, Record, RecordsResponse,
    ResourceKind,
};

pub use error::{Error, ErrorAction, Result};

pub use gateway::{GatewayFactory, MemoryGateway, RestGateway};
pub use manifest::{Manifest, ManifestEntry, ResourceSpec};
pub use reconciler::{ReconcileSummary, Reconciler};
pub use report::{Diagnostic, Diagnostics, Severity};
pub use resolver::ReferenceResolver;
pub use state::{StateFile, TrackedResource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
