//! Common test utilities for engine scenario tests.
//!
//! Provides builders for units, sources, fixture artifact trees, and a
//! polling helper for asserting on eventually-consistent unit phases.

#![allow(dead_code)]

use gitops_reconciler::reconciler::{Phase, ReconcileContext, StatusBoard};
use gitops_reconciler::sealed::{KeySource, SecretResolver};
use gitops_reconciler::source::{
    FilesystemFetcher, SourceDecl, SourceId, SourceKind, SourceTracker,
};
use gitops_reconciler::store::InMemoryStore;
use gitops_reconciler::unit::{ReconciliationUnit, UnitId};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub fn source_id(name: &str) -> SourceId {
    SourceId {
        kind: SourceKind::GitRepository,
        name: name.to_string(),
        namespace: "default".to_string(),
    }
}

pub fn source_decl(name: &str, url: &str) -> SourceDecl {
    SourceDecl {
        id: source_id(name),
        declaration_index: 0,
        url: url.to_string(),
        interval: Duration::from_secs(60),
    }
}

/// A unit with fast test timings and no health checks. Callers adjust
/// fields directly for scenario specifics.
pub fn test_unit(name: &str, path: &str, source: &str, deps: &[&str]) -> ReconciliationUnit {
    ReconciliationUnit {
        id: UnitId::new(name, "default"),
        declaration_index: 0,
        path: path.to_string(),
        source: source_id(source),
        depends_on: deps.iter().map(|d| UnitId::new(d, "default")).collect(),
        interval: Duration::from_secs(3600),
        retry_interval: Duration::from_millis(200),
        timeout: Duration::from_millis(500),
        prune: false,
        retries: 3,
        cleanup_on_fail: false,
        suspend: false,
        health_checks: Vec::new(),
        substitute_from: Vec::new(),
        substitution_enabled: false,
    }
}

/// Write a manifest file inside a fixture artifact tree.
pub fn write_manifest(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub fn configmap_yaml(name: &str) -> String {
    format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\ndata:\n  key: value\n")
}

/// Secret resolver with a freshly generated identity; returns the matching
/// recipient so tests can seal values.
pub fn resolver_with_key() -> (SecretResolver, age::x25519::Recipient) {
    use age::secrecy::ExposeSecret;

    let identity = age::x25519::Identity::generate();
    let recipient = identity.to_public();
    let key_text = identity.to_string();
    let key = KeySource::from_reader("test-key", key_text.expose_secret()).unwrap();
    let pattern = Regex::new("^(data|stringData)$").unwrap();
    (SecretResolver::new(pattern, Some(key)), recipient)
}

pub fn resolver_without_key() -> SecretResolver {
    let pattern = Regex::new("^(data|stringData)$").unwrap();
    SecretResolver::new(pattern, None)
}

/// Context over an in-memory store with a filesystem-backed source that has
/// already been fetched once.
pub async fn context_with_artifact(
    store: Arc<InMemoryStore>,
    secrets: SecretResolver,
    source: &SourceDecl,
) -> ReconcileContext {
    let tracker = Arc::new(SourceTracker::new());
    let fetcher = FilesystemFetcher::new();
    tracker.poll_once(source, &fetcher).await.unwrap();

    ReconcileContext {
        store,
        sources: tracker,
        secrets: Arc::new(secrets),
    }
}

/// Poll the board until the unit reaches the wanted phase or the deadline
/// passes. Returns whether the phase was reached.
pub async fn wait_for_phase(
    board: &StatusBoard,
    id: &UnitId,
    phase: Phase,
    within: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if let Some(status) = board.snapshot(id).await {
            if status.phase == phase {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Re-fetch a source so revision changes become visible to unit tasks.
pub async fn repoll_source(ctx: &ReconcileContext, source: &SourceDecl) {
    let fetcher = FilesystemFetcher::new();
    ctx.sources.poll_once(source, &fetcher).await.unwrap();
}
