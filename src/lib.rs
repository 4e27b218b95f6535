//! # GitOps Reconciler
//!
//! A reconciliation engine that continuously converges a resource store to
//! match a set of declarative `Kustomization` units organized into a
//! dependency graph.
//!
//! ## Overview
//!
//! The engine provides GitOps-style convergence by:
//!
//! 1. **Tracking sources** - Polls declared artifact sources (git checkout,
//!    OCI artifact, chart repository) and broadcasts revision changes
//! 2. **Gating on dependencies** - Units declare `dependsOn` edges; a unit
//!    reconciles only when every dependency is Ready
//! 3. **Rendering with substitution** - Expands `${VAR}` placeholders from
//!    layered ConfigMap/Secret-like providers (later providers win)
//! 4. **Sealed-secret decryption** - Decrypts `ENC[AGE,...]` envelopes in
//!    matching document fields just before apply, in-process
//! 5. **Applying and pruning** - Applies the rendered object set through the
//!    resource store boundary and deletes objects that left the render
//! 6. **Awaiting health** - Polls declared health-check targets until Ready
//!    or the unit's timeout elapses
//!
//! ## Boundaries
//!
//! The engine does not implement a cluster. The resource store
//! ([`store::ResourceStore`]) and the artifact source
//! ([`source::ArtifactFetcher`]) are traits; in-memory and filesystem
//! implementations ship with the crate for the binary and tests.
//!
//! Tests are included in the module files; scenario tests live in `tests/`.

pub mod constants;
pub mod graph;
pub mod health;
pub mod observability;
pub mod reconciler;
pub mod render;
pub mod scheduler;
pub mod sealed;
pub mod server;
pub mod source;
pub mod store;
pub mod substitute;
pub mod unit;
pub mod validation;

pub use graph::DependencyGraph;
pub use reconciler::{
    ConfigurationError, Phase, ReconcileContext, ReconcileError, StatusBoard, UnitStatus,
};
pub use scheduler::Scheduler;
pub use sealed::{KeySource, SecretResolver};
pub use source::{ArtifactFetcher, FilesystemFetcher, SourceTracker};
pub use store::{InMemoryStore, ObjectRef, ResourceStore};
pub use unit::{load_declarations, Declarations, ReconciliationUnit, UnitId};
