//! # Resource Store Boundary
//!
//! The engine does not implement a cluster. It converges rendered objects
//! against a [`ResourceStore`], an external boundary exposing apply/get/delete
//! primitives. Apply reports a per-object outcome so the reconciler can log
//! partial failures and roll back what it applied.
//!
//! [`InMemoryStore`] is the implementation used by the binary and the tests.
//! It tolerates concurrent writers across independent units and supports
//! per-reference failure injection so apply-error paths can be exercised.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tokio::sync::RwLock;

/// Identity of an object in the resource store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ObjectRef {
    pub fn new(kind: &str, name: &str, namespace: Option<&str>) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A fully rendered object ready to be applied: its identity plus manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedObject {
    pub reference: ObjectRef,
    pub manifest: serde_json::Value,
}

/// Errors surfaced by the store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store rejected {reference}: {message}")]
    Rejected { reference: ObjectRef, message: String },
}

/// Per-object apply outcome. The reconciler treats any error as an apply
/// failure for the whole pass but keeps the applied list for rollback.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub reference: ObjectRef,
    pub result: Result<(), StoreError>,
}

/// External resource store: apply/get/delete primitives the engine converges
/// against. Implementations must tolerate concurrent writers across
/// independent units.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Apply the object set; returns one outcome per object in input order.
    async fn apply(&self, objects: &[RenderedObject]) -> Vec<ApplyOutcome>;

    /// Delete the referenced objects. Deleting an absent object is not an
    /// error (delete is idempotent).
    async fn delete(&self, refs: &[ObjectRef]) -> Result<(), StoreError>;

    /// Fetch a single object, or `None` when absent.
    async fn get(&self, reference: &ObjectRef) -> Option<serde_json::Value>;
}

/// In-memory resource store for the binary and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: RwLock<HashMap<ObjectRef, serde_json::Value>>,
    rejected: RwLock<HashSet<ObjectRef>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing apply. Used to stand up
    /// health-check targets in tests.
    pub async fn insert(&self, reference: ObjectRef, manifest: serde_json::Value) {
        self.objects.write().await.insert(reference, manifest);
    }

    /// Mark a reference so subsequent applies of it fail. Clearing happens
    /// via [`InMemoryStore::allow`].
    pub async fn reject(&self, reference: ObjectRef) {
        self.rejected.write().await.insert(reference);
    }

    /// Remove a failure-injection mark set by [`InMemoryStore::reject`].
    pub async fn allow(&self, reference: &ObjectRef) {
        self.rejected.write().await.remove(reference);
    }

    pub async fn contains(&self, reference: &ObjectRef) -> bool {
        self.objects.read().await.contains_key(reference)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn apply(&self, objects: &[RenderedObject]) -> Vec<ApplyOutcome> {
        let rejected = self.rejected.read().await;
        let mut store = self.objects.write().await;
        let mut outcomes = Vec::with_capacity(objects.len());

        for object in objects {
            if rejected.contains(&object.reference) {
                outcomes.push(ApplyOutcome {
                    reference: object.reference.clone(),
                    result: Err(StoreError::Rejected {
                        reference: object.reference.clone(),
                        message: "injected apply failure".to_string(),
                    }),
                });
                continue;
            }

            store.insert(object.reference.clone(), object.manifest.clone());
            outcomes.push(ApplyOutcome {
                reference: object.reference.clone(),
                result: Ok(()),
            });
        }

        outcomes
    }

    async fn delete(&self, refs: &[ObjectRef]) -> Result<(), StoreError> {
        let mut store = self.objects.write().await;
        for reference in refs {
            store.remove(reference);
        }
        Ok(())
    }

    async fn get(&self, reference: &ObjectRef) -> Option<serde_json::Value> {
        self.objects.read().await.get(reference).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(name: &str) -> RenderedObject {
        RenderedObject {
            reference: ObjectRef::new("ConfigMap", name, Some("default")),
            manifest: json!({"kind": "ConfigMap", "metadata": {"name": name}}),
        }
    }

    #[tokio::test]
    async fn test_apply_and_get() {
        let store = InMemoryStore::new();
        let outcomes = store.apply(&[obj("a"), obj("b")]).await;
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(store.len().await, 2);

        let fetched = store
            .get(&ObjectRef::new("ConfigMap", "a", Some("default")))
            .await;
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryStore::new();
        store.apply(&[obj("a")]).await;

        let reference = ObjectRef::new("ConfigMap", "a", Some("default"));
        store.delete(std::slice::from_ref(&reference)).await.unwrap();
        assert!(!store.contains(&reference).await);

        // Second delete of the same ref succeeds
        store.delete(std::slice::from_ref(&reference)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_injection_is_per_object() {
        let store = InMemoryStore::new();
        store
            .reject(ObjectRef::new("ConfigMap", "b", Some("default")))
            .await;

        let outcomes = store.apply(&[obj("a"), obj("b")]).await;
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());

        // The rejected object was not stored; the healthy one was
        assert!(store.contains(&outcomes[0].reference).await);
        assert!(!store.contains(&outcomes[1].reference).await);
    }
}
