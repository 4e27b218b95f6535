//! # Health Evaluation
//!
//! Classifies declared health-check targets against live objects in the
//! resource store. `Unknown` means the target exists but its readiness
//! predicate cannot be evaluated yet (status not populated, or the observed
//! generation lags the declared one); `NotReady` is an evaluated-but-failing
//! condition; `NotFound` is terminal until the target appears.

use crate::store::{ObjectRef, ResourceStore};
use crate::unit::HealthCheckTarget;
use tracing::debug;

/// Classification of one health-check target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ready,
    NotReady,
    Unknown,
    NotFound,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::NotReady => "NotReady",
            Self::Unknown => "Unknown",
            Self::NotFound => "NotFound",
        }
    }
}

/// Evaluate one target. Targets without a namespace inherit the owning
/// unit's namespace.
pub async fn evaluate(
    target: &HealthCheckTarget,
    default_namespace: &str,
    store: &dyn ResourceStore,
) -> HealthStatus {
    let reference = ObjectRef::new(
        &target.kind,
        &target.name,
        Some(target.namespace.as_deref().unwrap_or(default_namespace)),
    );

    let Some(object) = store.get(&reference).await else {
        debug!(target = %reference, "health target not found");
        return HealthStatus::NotFound;
    };

    let status = classify(&object);
    debug!(target = %reference, status = status.as_str(), "health target evaluated");
    status
}

fn classify(object: &serde_json::Value) -> HealthStatus {
    let Some(status) = object.get("status").filter(|s| s.is_object()) else {
        return HealthStatus::Unknown;
    };

    // A status observed at an older generation describes a previous spec
    let generation = object.pointer("/metadata/generation").and_then(|g| g.as_i64());
    let observed = status.get("observedGeneration").and_then(|g| g.as_i64());
    if let (Some(generation), Some(observed)) = (generation, observed) {
        if observed < generation {
            return HealthStatus::Unknown;
        }
    }

    if let Some(conditions) = status.get("conditions").and_then(|c| c.as_array()) {
        for wanted in ["Ready", "Available"] {
            let condition = conditions.iter().find(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some(wanted)
            });
            if let Some(condition) = condition {
                return match condition.get("status").and_then(|s| s.as_str()) {
                    Some("True") => HealthStatus::Ready,
                    Some("False") => HealthStatus::NotReady,
                    _ => HealthStatus::Unknown,
                };
            }
        }
    }

    // Replica-count fallback for workload-shaped objects
    if let Some(ready_replicas) = status.get("readyReplicas").and_then(|r| r.as_i64()) {
        let desired = object
            .pointer("/spec/replicas")
            .and_then(|r| r.as_i64())
            .unwrap_or(1);
        return if ready_replicas >= desired {
            HealthStatus::Ready
        } else {
            HealthStatus::NotReady
        };
    }

    HealthStatus::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn target(name: &str) -> HealthCheckTarget {
        HealthCheckTarget {
            kind: "Deployment".to_string(),
            name: name.to_string(),
            namespace: None,
        }
    }

    async fn store_with(name: &str, manifest: serde_json::Value) -> InMemoryStore {
        let store = InMemoryStore::new();
        store
            .insert(ObjectRef::new("Deployment", name, Some("default")), manifest)
            .await;
        store
    }

    #[tokio::test]
    async fn test_absent_target_is_not_found() {
        let store = InMemoryStore::new();
        let status = evaluate(&target("web"), "default", &store).await;
        assert_eq!(status, HealthStatus::NotFound);
    }

    #[tokio::test]
    async fn test_missing_status_is_unknown() {
        let store = store_with("web", json!({"kind": "Deployment", "metadata": {"name": "web"}})).await;
        let status = evaluate(&target("web"), "default", &store).await;
        assert_eq!(status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_stale_observed_generation_is_unknown() {
        let store = store_with(
            "web",
            json!({
                "kind": "Deployment",
                "metadata": {"name": "web", "generation": 3},
                "status": {
                    "observedGeneration": 2,
                    "conditions": [{"type": "Ready", "status": "True"}]
                }
            }),
        )
        .await;
        let status = evaluate(&target("web"), "default", &store).await;
        assert_eq!(status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_ready_condition() {
        let store = store_with(
            "web",
            json!({
                "kind": "Deployment",
                "metadata": {"name": "web"},
                "status": {"conditions": [{"type": "Ready", "status": "True"}]}
            }),
        )
        .await;
        assert_eq!(
            evaluate(&target("web"), "default", &store).await,
            HealthStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_failing_condition_is_not_ready() {
        let store = store_with(
            "web",
            json!({
                "kind": "Deployment",
                "metadata": {"name": "web"},
                "status": {"conditions": [{"type": "Available", "status": "False"}]}
            }),
        )
        .await;
        assert_eq!(
            evaluate(&target("web"), "default", &store).await,
            HealthStatus::NotReady
        );
    }

    #[tokio::test]
    async fn test_replica_count_fallback() {
        let ready = store_with(
            "web",
            json!({
                "kind": "Deployment",
                "metadata": {"name": "web"},
                "spec": {"replicas": 2},
                "status": {"readyReplicas": 2}
            }),
        )
        .await;
        assert_eq!(
            evaluate(&target("web"), "default", &ready).await,
            HealthStatus::Ready
        );

        let lagging = store_with(
            "web",
            json!({
                "kind": "Deployment",
                "metadata": {"name": "web"},
                "spec": {"replicas": 2},
                "status": {"readyReplicas": 1}
            }),
        )
        .await;
        assert_eq!(
            evaluate(&target("web"), "default", &lagging).await,
            HealthStatus::NotReady
        );
    }

    #[tokio::test]
    async fn test_condition_with_unknown_status() {
        let store = store_with(
            "web",
            json!({
                "kind": "Deployment",
                "metadata": {"name": "web"},
                "status": {"conditions": [{"type": "Ready", "status": "Unknown"}]}
            }),
        )
        .await;
        assert_eq!(
            evaluate(&target("web"), "default", &store).await,
            HealthStatus::Unknown
        );
    }
}
