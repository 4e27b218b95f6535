//! # Reconciler
//!
//! One convergence pass per unit: render the manifest set, resolve
//! substitutions, decrypt sealed documents, apply, await health, record
//! status. All state transitions for a unit are serialized by its owning
//! task; status is published as immutable snapshots through the
//! [`StatusBoard`].

mod pass;
mod status;
mod types;

pub use pass::{reconcile, record_failure, ReconcileContext};
pub use status::{Condition, Phase, StatusBoard, UnitStatus};
pub use types::{ReconcileError, RetryDecision, TriggerSource};

pub use crate::unit::ConfigurationError;
