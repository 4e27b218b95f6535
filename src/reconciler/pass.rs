//! # Reconcile Pass
//!
//! The per-unit convergence pass: Pending -> Rendering -> Applying ->
//! AwaitingHealth -> Ready | Failed. A rendering or decryption failure
//! aborts before anything is applied; an apply failure optionally rolls
//! back the objects applied in the failing pass; health waits are bounded
//! by the unit's timeout and cancel promptly.

use crate::constants;
use crate::health::{self, HealthStatus};
use crate::observability::metrics;
use crate::reconciler::status::{Phase, StatusBoard};
use crate::reconciler::types::{retry_decision, ReconcileError, RetryDecision, TriggerSource};
use crate::render::{collect_manifest_files, parse_object, read_manifest_file, split_documents};
use crate::sealed::{is_sealed_document, SecretResolver};
use crate::source::{Artifact, SourceError, SourceTracker};
use crate::store::{ObjectRef, RenderedObject, ResourceStore};
use crate::substitute::{load_providers, substitute, Environment};
use crate::unit::ReconciliationUnit;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Shared dependencies for every reconcile pass. Key material inside the
/// secret resolver is read-only and shared without mutation.
#[derive(Clone)]
pub struct ReconcileContext {
    pub store: Arc<dyn ResourceStore>,
    pub sources: Arc<SourceTracker>,
    pub secrets: Arc<SecretResolver>,
}

impl std::fmt::Debug for ReconcileContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileContext")
            .field("secrets", &self.secrets)
            .finish_non_exhaustive()
    }
}

/// Run one convergence pass for a unit. Returns the applied revision on
/// success. The caller (the unit's owning task) records failures via
/// [`record_failure`].
pub async fn reconcile(
    unit: &ReconciliationUnit,
    ctx: &ReconcileContext,
    board: &StatusBoard,
    trigger: TriggerSource,
) -> Result<String, ReconcileError> {
    let start = Instant::now();
    info!(unit = %unit.id, trigger = trigger.as_str(), "reconciling unit");
    metrics::increment_reconciliations();

    let span = info_span!(
        "reconcile",
        unit.name = %unit.id.name,
        unit.namespace = %unit.id.namespace,
        trigger = trigger.as_str()
    );

    let result = run_pass(unit, ctx, board).instrument(span).await;

    match &result {
        Ok(revision) => {
            metrics::observe_reconcile_duration(start.elapsed().as_secs_f64());
            info!(unit = %unit.id, revision = %revision, "unit reconciled");
        }
        Err(e) => {
            metrics::increment_reconciliation_errors(e.class());
            error!(unit = %unit.id, class = e.class(), "reconciliation failed: {e}");
        }
    }

    result
}

async fn run_pass(
    unit: &ReconciliationUnit,
    ctx: &ReconcileContext,
    board: &StatusBoard,
) -> Result<String, ReconcileError> {
    let artifact = ctx
        .sources
        .current(&unit.source)
        .await
        .ok_or_else(|| SourceError::NotYetFetched(unit.source.clone()))?;
    let revision = artifact.revision.clone();

    board
        .update_phase(
            &unit.id,
            Phase::Rendering,
            Some(&format!("rendering revision {revision}")),
        )
        .await;
    {
        let attempted = revision.clone();
        board
            .mutate(&unit.id, move |status| {
                status.last_attempted_revision = Some(attempted);
            })
            .await;
    }

    // Rendering failure means nothing is applied, not a partial set
    let objects = render_unit(unit, ctx, &artifact).await?;

    board
        .update_phase(
            &unit.id,
            Phase::Applying,
            Some(&format!("applying {} objects", objects.len())),
        )
        .await;

    let outcomes = ctx.store.apply(&objects).await;
    let mut applied: Vec<ObjectRef> = Vec::with_capacity(outcomes.len());
    let mut failures: Vec<String> = Vec::new();

    for outcome in outcomes {
        match outcome.result {
            Ok(()) => {
                debug!(object = %outcome.reference, "object applied");
                applied.push(outcome.reference);
            }
            Err(e) => {
                error!(object = %outcome.reference, "apply rejected: {e}");
                failures.push(e.to_string());
            }
        }
    }

    if let Some(first) = failures.first() {
        if unit.cleanup_on_fail && !applied.is_empty() {
            warn!(
                unit = %unit.id,
                count = applied.len(),
                "apply failed, rolling back objects applied in this pass"
            );
            if let Err(e) = ctx.store.delete(&applied).await {
                error!(unit = %unit.id, "rollback failed: {e}");
            }
        }

        return Err(ReconcileError::Apply {
            failed: failures.len(),
            total: objects.len(),
            first: first.clone(),
        });
    }

    metrics::increment_objects_applied(applied.len() as u64);

    if unit.prune {
        let current: HashSet<&ObjectRef> = applied.iter().collect();
        let previous = board
            .snapshot(&unit.id)
            .await
            .map(|s| s.inventory)
            .unwrap_or_default();
        let stale: Vec<ObjectRef> = previous
            .into_iter()
            .filter(|reference| !current.contains(reference))
            .collect();

        if !stale.is_empty() {
            info!(unit = %unit.id, count = stale.len(), "pruning objects absent from current render");
            ctx.store.delete(&stale).await.map_err(|e| ReconcileError::Apply {
                failed: stale.len(),
                total: stale.len(),
                first: e.to_string(),
            })?;
            metrics::increment_objects_pruned(stale.len() as u64);
        }
    }

    {
        let mut inventory = applied;
        inventory.sort();
        board
            .mutate(&unit.id, move |status| {
                status.inventory = inventory;
            })
            .await;
    }

    if !unit.health_checks.is_empty() {
        board
            .update_phase(
                &unit.id,
                Phase::AwaitingHealth,
                Some(&format!("waiting for {} health checks", unit.health_checks.len())),
            )
            .await;
        await_health(unit, ctx).await?;
    }

    {
        let applied_revision = revision.clone();
        board
            .mutate(&unit.id, move |status| {
                status.last_applied_revision = Some(applied_revision);
                status.last_error = None;
                status.retry_count = 0;
                status.next_retry_time = None;
            })
            .await;
    }
    board
        .update_phase(
            &unit.id,
            Phase::Ready,
            Some(&format!("applied revision {revision}")),
        )
        .await;

    Ok(revision)
}

/// Render the unit's manifest set: substitution first (when the unit is
/// marked), then sealed-document decryption, then identity extraction.
async fn render_unit(
    unit: &ReconciliationUnit,
    ctx: &ReconcileContext,
    artifact: &Artifact,
) -> Result<Vec<RenderedObject>, ReconcileError> {
    let files = collect_manifest_files(&artifact.path, &unit.path)?;

    let environment: Option<Environment> = if unit.substitution_enabled {
        let providers = load_providers(unit, ctx.store.as_ref(), ctx.secrets.as_ref()).await?;
        let environment = Environment::from_providers(&providers);
        debug!(
            unit = %unit.id,
            variables = ?environment.redacted(),
            "substitution environment resolved"
        );
        Some(environment)
    } else {
        None
    };

    let mut objects = Vec::new();

    for file in files {
        let content = read_manifest_file(&file)?;

        for document in split_documents(&content) {
            let document = match &environment {
                Some(env) => substitute(&document, env)
                    .map_err(crate::render::RenderError::from)?,
                None => document,
            };

            let Some(object) = parse_object(&document, &file, &unit.id.namespace)? else {
                continue;
            };

            let object = if is_sealed_document(&object.manifest, ctx.secrets.pattern()) {
                RenderedObject {
                    reference: object.reference.clone(),
                    manifest: ctx.secrets.decrypt_document(&object.manifest)?,
                }
            } else {
                object
            };

            objects.push(object);
        }
    }

    debug!(unit = %unit.id, count = objects.len(), "manifest set rendered");
    Ok(objects)
}

/// Poll all declared targets at a fixed sub-interval until every one is
/// Ready or the unit's timeout elapses. Returns promptly on timeout with a
/// clean HealthTimeout error; no polling continues afterwards.
async fn await_health(
    unit: &ReconciliationUnit,
    ctx: &ReconcileContext,
) -> Result<(), ReconcileError> {
    let poll_interval = std::time::Duration::from_secs(constants::HEALTH_POLL_INTERVAL_SECS);
    let deadline = tokio::time::Instant::now() + unit.timeout;

    loop {
        let mut pending = 0usize;
        for target in &unit.health_checks {
            let status = health::evaluate(target, &unit.id.namespace, ctx.store.as_ref()).await;
            if status != HealthStatus::Ready {
                debug!(
                    unit = %unit.id,
                    target = %target.name,
                    status = status.as_str(),
                    "health target not ready"
                );
                pending += 1;
            }
        }

        if pending == 0 {
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(ReconcileError::HealthTimeout {
                timeout: unit.timeout,
                pending,
            });
        }

        tokio::time::sleep_until(std::cmp::min(
            deadline,
            tokio::time::Instant::now() + poll_interval,
        ))
        .await;
    }
}

/// Record a failed pass on the unit's status and decide whether to retry.
///
/// Install-path failures (the unit has never been Ready at any revision)
/// retry without bound; upgrade-path failures consume the bounded budget
/// and then stall until a new revision supersedes them.
pub async fn record_failure(
    unit: &ReconciliationUnit,
    board: &StatusBoard,
    error: &ReconcileError,
) -> RetryDecision {
    let snapshot = board.snapshot(&unit.id).await.unwrap_or_default();
    let decision = retry_decision(
        unit.retry_interval,
        unit.retries,
        snapshot.retry_count,
        snapshot.ever_ready(),
    );

    let next_retry_time = match decision {
        RetryDecision::RetryAfter(delay) => chrono::Utc::now()
            .checked_add_signed(
                chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            )
            .map(|t| t.to_rfc3339()),
        RetryDecision::Stall => None,
    };

    let message = error.to_string();
    {
        let last_error = message.clone();
        board
            .mutate(&unit.id, move |status| {
                status.retry_count += 1;
                status.last_error = Some(last_error);
                status.next_retry_time = next_retry_time;
            })
            .await;
    }

    let phase = match decision {
        RetryDecision::RetryAfter(_) => Phase::Failed,
        RetryDecision::Stall => Phase::Stalled,
    };
    board.update_phase(&unit.id, phase, Some(&message)).await;

    if matches!(decision, RetryDecision::Stall) {
        warn!(
            unit = %unit.id,
            retries = unit.retries,
            "retry budget exhausted, unit stalled until a new revision arrives"
        );
    }

    decision
}
