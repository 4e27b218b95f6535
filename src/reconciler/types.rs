//! # Types
//!
//! Error taxonomy and trigger bookkeeping for the reconciler.

use crate::render::RenderError;
use crate::sealed::DecryptionError;
use crate::source::SourceError;
use crate::substitute::ProviderError;
use std::time::Duration;
use thiserror::Error;

/// Why a reconciliation pass was triggered. Tracked for debugging and
/// observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Initial pass after startup
    Startup,
    /// Timer-based periodic reconciliation (unit interval)
    Timer,
    /// Upstream source revision changed
    SourceChange,
    /// Retry after a failed pass (retryInterval)
    Retry,
    /// A dependency became Ready while this unit was gated
    DependencyReady,
}

impl TriggerSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerSource::Startup => "startup",
            TriggerSource::Timer => "timer",
            TriggerSource::SourceChange => "source-change",
            TriggerSource::Retry => "retry",
            TriggerSource::DependencyReady => "dependency-ready",
        }
    }
}

/// Failures local to a unit's reconcile pass. Each maps to one class in the
/// error taxonomy; configuration errors are separate because they are fatal
/// at load and never retried.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("apply failed: {failed} of {total} objects rejected, first: {first}")]
    Apply {
        failed: usize,
        total: usize,
        first: String,
    },

    #[error("health check timed out after {timeout:?} with {pending} targets not ready")]
    HealthTimeout { timeout: Duration, pending: usize },
}

impl ReconcileError {
    /// Error class label used in metrics and status reasons.
    #[must_use]
    pub fn class(&self) -> &'static str {
        match self {
            ReconcileError::Render(_) => "render",
            ReconcileError::Decryption(_) => "decryption",
            ReconcileError::Source(_) => "source",
            ReconcileError::Apply { .. } => "apply",
            ReconcileError::HealthTimeout { .. } => "health-timeout",
        }
    }
}

impl From<ProviderError> for ReconcileError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::Missing { name } => {
                ReconcileError::Render(RenderError::MissingProvider { name })
            }
            ProviderError::Malformed { name, message } => {
                ReconcileError::Render(RenderError::MalformedProvider { name, message })
            }
            ProviderError::Decryption(e) => ReconcileError::Decryption(e),
        }
    }
}

/// What the owning task should do after a failed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the unit's retryInterval
    RetryAfter(Duration),
    /// Bounded retry budget exhausted: stay Stalled until a new revision
    Stall,
}

/// Retry policy: fixed retryInterval; unlimited while the unit has never
/// been Ready at any revision (install path), bounded by the unit's retry
/// budget afterwards (upgrade path).
#[must_use]
pub fn retry_decision(
    retry_interval: Duration,
    retry_budget: u32,
    retry_count: u32,
    ever_ready: bool,
) -> RetryDecision {
    if !ever_ready || retry_count < retry_budget {
        RetryDecision::RetryAfter(retry_interval)
    } else {
        RetryDecision::Stall
    }
}
