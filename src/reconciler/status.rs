//! # Unit Status
//!
//! Status snapshots per unit, owned exclusively by the unit's reconcile
//! task and published through the [`StatusBoard`]. Readers (dependency
//! gating, the scheduler, the HTTP status endpoint) only ever see immutable
//! copies; nothing outside the owning task mutates a unit's status.

use crate::store::ObjectRef;
use crate::unit::UnitId;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Reconciliation phase of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Pending,
    Rendering,
    Applying,
    AwaitingHealth,
    Ready,
    Failed,
    /// Bounded retry budget exhausted; superseded only by a new revision
    Stalled,
    Suspended,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Rendering => "Rendering",
            Phase::Applying => "Applying",
            Phase::AwaitingHealth => "AwaitingHealth",
            Phase::Ready => "Ready",
            Phase::Failed => "Failed",
            Phase::Stalled => "Stalled",
            Phase::Suspended => "Suspended",
        }
    }

    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Phase::Ready)
    }
}

/// One status condition, RFC3339-stamped on transition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    pub last_transition_time: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

/// Full status snapshot for one unit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatus {
    pub phase: Phase,
    pub description: Option<String>,
    pub conditions: Vec<Condition>,
    /// Revision of the last successful apply
    pub last_applied_revision: Option<String>,
    /// Revision of the most recent attempt, successful or not
    pub last_attempted_revision: Option<String>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub next_retry_time: Option<String>,
    pub last_reconcile_time: Option<String>,
    /// Objects applied by the last successful pass; the prune baseline
    pub inventory: Vec<ObjectRef>,
}

impl Default for UnitStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Pending,
            description: None,
            conditions: Vec::new(),
            last_applied_revision: None,
            last_attempted_revision: None,
            last_error: None,
            retry_count: 0,
            next_retry_time: None,
            last_reconcile_time: None,
            inventory: Vec::new(),
        }
    }
}

impl UnitStatus {
    /// Whether any revision has ever been applied and confirmed Ready.
    /// Selects the install-path (unbounded) vs upgrade-path (bounded) retry
    /// policy.
    #[must_use]
    pub fn ever_ready(&self) -> bool {
        self.last_applied_revision.is_some()
    }
}

/// Shared read view over all unit statuses plus a change broadcast.
///
/// Writes go through [`StatusBoard::publish`] and [`StatusBoard::mutate`],
/// called only from the unit's owning task.
#[derive(Debug)]
pub struct StatusBoard {
    statuses: RwLock<HashMap<UnitId, UnitStatus>>,
    changes: broadcast::Sender<UnitId>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            statuses: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Notified on every status change; used by gated units to re-evaluate
    /// dependency readiness.
    pub fn subscribe(&self) -> broadcast::Receiver<UnitId> {
        self.changes.subscribe()
    }

    pub async fn snapshot(&self, id: &UnitId) -> Option<UnitStatus> {
        self.statuses.read().await.get(id).cloned()
    }

    /// All statuses, sorted by unit id for stable rendering.
    pub async fn all(&self) -> BTreeMap<UnitId, UnitStatus> {
        self.statuses
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn is_ready(&self, id: &UnitId) -> bool {
        self.statuses
            .read()
            .await
            .get(id)
            .map(|s| s.phase.is_ready())
            .unwrap_or(false)
    }

    /// Replace a unit's status wholesale.
    pub async fn publish(&self, id: &UnitId, status: UnitStatus) {
        self.statuses.write().await.insert(id.clone(), status);
        let _ = self.changes.send(id.clone());
    }

    /// Apply an in-place edit to a unit's status and broadcast the change.
    pub async fn mutate<F>(&self, id: &UnitId, edit: F)
    where
        F: FnOnce(&mut UnitStatus),
    {
        {
            let mut statuses = self.statuses.write().await;
            edit(statuses.entry(id.clone()).or_default());
        }
        let _ = self.changes.send(id.clone());
    }

    /// Update phase and description, refreshing the Ready condition.
    /// Checks whether the status actually changed first so unchanged phases
    /// do not generate spurious change notifications.
    pub async fn update_phase(&self, id: &UnitId, phase: Phase, message: Option<&str>) {
        {
            let statuses = self.statuses.read().await;
            if let Some(current) = statuses.get(id) {
                if current.phase == phase && current.description.as_deref() == message {
                    debug!(unit = %id, phase = phase.as_str(), "status unchanged, skipping update");
                    return;
                }
            }
        }

        let now = chrono::Utc::now().to_rfc3339();
        let ready_status = if phase.is_ready() { "True" } else { "False" };
        let ready_reason = match phase {
            Phase::Ready => "ReconciliationSucceeded",
            Phase::Failed | Phase::Stalled => "ReconciliationFailed",
            Phase::Suspended => "ReconciliationSuspended",
            _ => "ReconciliationInProgress",
        };

        self.mutate(id, |status| {
            status.phase = phase;
            status.description = message.map(str::to_string);
            status.last_reconcile_time = Some(now.clone());
            status.conditions = vec![Condition {
                r#type: "Ready".to_string(),
                status: ready_status.to_string(),
                last_transition_time: Some(now.clone()),
                reason: Some(ready_reason.to_string()),
                message: message.map(str::to_string),
            }];
        })
        .await;
    }
}
