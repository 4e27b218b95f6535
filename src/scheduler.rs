//! # Scheduler
//!
//! One lightweight task per unit drives that unit's timer, listens for
//! source revision-change events, and enqueues reconcile passes. Units
//! reconcile concurrently; the only cross-unit ordering is the dependency
//! gate. All state transitions for a single unit are serialized by its
//! owning task, so a trigger arriving mid-pass queues rather than preempts.

use crate::graph::DependencyGraph;
use crate::observability::metrics;
use crate::reconciler::{
    reconcile, record_failure, Phase, ReconcileContext, RetryDecision, StatusBoard, TriggerSource,
};
use crate::unit::ReconciliationUnit;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Drives reconciliation for a set of units against shared context.
#[derive(Debug, Clone)]
pub struct Scheduler {
    graph: Arc<DependencyGraph>,
    board: Arc<StatusBoard>,
    ctx: ReconcileContext,
}

impl Scheduler {
    pub fn new(graph: Arc<DependencyGraph>, board: Arc<StatusBoard>, ctx: ReconcileContext) -> Self {
        Self { graph, board, ctx }
    }

    pub fn board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.board)
    }

    /// Spawn the owning task for every unit.
    pub fn spawn_all(
        &self,
        units: Vec<ReconciliationUnit>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        units
            .into_iter()
            .map(|unit| self.spawn_unit(unit, shutdown.clone()))
            .collect()
    }

    /// Spawn the owning task for one unit. The task runs until shutdown.
    pub fn spawn_unit(
        &self,
        unit: ReconciliationUnit,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let graph = Arc::clone(&self.graph);
        let board = Arc::clone(&self.board);
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            run_unit(unit, graph, board, ctx, shutdown).await;
        })
    }
}

async fn run_unit(
    unit: ReconciliationUnit,
    graph: Arc<DependencyGraph>,
    board: Arc<StatusBoard>,
    ctx: ReconcileContext,
    mut shutdown: watch::Receiver<bool>,
) {
    // Seed the Pending status so dependents and observers see the unit
    board.mutate(&unit.id, |_| {}).await;

    if unit.suspend {
        info!(unit = %unit.id, "reconciliation suspended, skipping unit");
        board
            .update_phase(
                &unit.id,
                Phase::Suspended,
                Some("Reconciliation is suspended - no passes will run"),
            )
            .await;
        let _ = shutdown.wait_for(|stop| *stop).await;
        return;
    }

    info!(
        unit = %unit.id,
        interval = ?unit.interval,
        dependencies = unit.depends_on.len(),
        "unit scheduling started"
    );

    let mut source_events = ctx.sources.subscribe();
    let mut ticker = tokio::time::interval(unit.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut first_pass = true;
    let mut pending_retry: Option<tokio::time::Instant> = None;

    loop {
        // Captures a copy of the deadline so the arms below can clear it
        let retry_sleep = async move {
            match pending_retry {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        let trigger = tokio::select! {
            _ = ticker.tick() => {
                if first_pass {
                    first_pass = false;
                    TriggerSource::Startup
                } else {
                    TriggerSource::Timer
                }
            }
            event = source_events.recv() => {
                match event {
                    Ok(event) if event.source == unit.source => {
                        // A new revision supersedes any stall and resets the
                        // bounded retry budget
                        board
                            .mutate(&unit.id, |status| {
                                status.retry_count = 0;
                            })
                            .await;
                        pending_retry = None;
                        TriggerSource::SourceChange
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(unit = %unit.id, skipped, "source event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            _ = retry_sleep => {
                pending_retry = None;
                TriggerSource::Retry
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(unit = %unit.id, "unit scheduling stopped");
                    return;
                }
                continue;
            }
        };

        // A stalled unit only leaves Stalled via a new source revision
        let snapshot = board.snapshot(&unit.id).await.unwrap_or_default();
        if snapshot.phase == Phase::Stalled && trigger != TriggerSource::SourceChange {
            debug!(unit = %unit.id, trigger = trigger.as_str(), "unit stalled, ignoring trigger");
            continue;
        }

        // Dependency gate: stay Pending until every dependency is Ready
        if !wait_for_dependencies(&unit, &graph, &board, &mut shutdown).await {
            return;
        }

        match reconcile(&unit, &ctx, &board, trigger).await {
            Ok(_) => {
                pending_retry = None;
            }
            Err(error) => match record_failure(&unit, &board, &error).await {
                RetryDecision::RetryAfter(delay) => {
                    pending_retry = Some(tokio::time::Instant::now() + delay);
                }
                RetryDecision::Stall => {
                    pending_retry = None;
                }
            },
        }

        update_ready_gauge(&board).await;
    }
}

/// Block until every dependency of `unit` is Ready, re-evaluating on status
/// changes. Returns `false` when shutdown interrupts the wait.
async fn wait_for_dependencies(
    unit: &ReconciliationUnit,
    graph: &DependencyGraph,
    board: &StatusBoard,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let dependencies = graph.dependencies(&unit.id);
    if dependencies.is_empty() {
        return true;
    }

    let mut changes = board.subscribe();

    loop {
        let mut blocking = None;
        for dependency in dependencies {
            if !board.is_ready(dependency).await {
                blocking = Some(dependency.clone());
                break;
            }
        }

        let Some(blocking) = blocking else {
            return true;
        };

        debug!(unit = %unit.id, dependency = %blocking, "dependency not ready, unit stays pending");
        board
            .update_phase(
                &unit.id,
                Phase::Pending,
                Some(&format!("waiting for dependency {blocking} to become Ready")),
            )
            .await;

        tokio::select! {
            change = changes.recv() => {
                match change {
                    // Any status movement re-evaluates the gate; lag simply
                    // forces an extra evaluation
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}

async fn update_ready_gauge(board: &StatusBoard) {
    let ready = board
        .all()
        .await
        .values()
        .filter(|status| status.phase.is_ready())
        .count();
    metrics::set_units_ready(ready as i64);
}
