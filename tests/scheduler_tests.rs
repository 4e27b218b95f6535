//! # Scheduler Tests
//!
//! Concurrent unit scheduling: dependency gating, failure isolation, retry
//! pacing, stall-until-new-revision, and source-change triggers.

mod common;

use common::*;
use gitops_reconciler::graph::DependencyGraph;
use gitops_reconciler::reconciler::{Phase, ReconcileContext, StatusBoard};
use gitops_reconciler::scheduler::Scheduler;
use gitops_reconciler::store::{InMemoryStore, ObjectRef};
use gitops_reconciler::unit::HealthCheckTarget;
use std::sync::Arc;
use std::time::Duration;

fn scheduler_for(ctx: ReconcileContext, units: &[gitops_reconciler::ReconciliationUnit]) -> (Scheduler, Arc<StatusBoard>) {
    let graph = Arc::new(DependencyGraph::build(units).unwrap());
    let board = Arc::new(StatusBoard::new());
    (Scheduler::new(graph, Arc::clone(&board), ctx), board)
}

#[tokio::test]
async fn test_failing_unit_blocks_only_its_dependents() {
    let artifact = tempfile::tempdir().unwrap();
    write_manifest(artifact.path(), "apps/a/cm.yaml", &configmap_yaml("a"));
    write_manifest(artifact.path(), "apps/b/cm.yaml", &configmap_yaml("b"));
    write_manifest(artifact.path(), "apps/c/cm.yaml", &configmap_yaml("c"));

    let source = source_decl("repo", artifact.path().to_str().unwrap());
    let store = Arc::new(InMemoryStore::new());
    let a_ref = ObjectRef::new("ConfigMap", "a", Some("default"));
    store.reject(a_ref.clone()).await;

    let ctx = context_with_artifact(Arc::clone(&store), resolver_without_key(), &source).await;

    let a = test_unit("a", "./apps/a", "repo", &[]);
    let mut b = test_unit("b", "./apps/b", "repo", &["a"]);
    b.timeout = Duration::from_millis(300);
    b.health_checks = vec![HealthCheckTarget {
        kind: "Deployment".to_string(),
        name: "never-appears".to_string(),
        namespace: None,
    }];
    let c = test_unit("c", "./apps/c", "repo", &["a", "b"]);

    let units = vec![a.clone(), b.clone(), c.clone()];
    let (scheduler, board) = scheduler_for(ctx, &units);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tasks = scheduler.spawn_all(units, &shutdown_rx);

    // A fails Applying; B and C never leave Pending
    assert!(wait_for_phase(&board, &a.id, Phase::Failed, Duration::from_secs(2)).await);
    assert_eq!(board.snapshot(&b.id).await.unwrap().phase, Phase::Pending);
    assert_eq!(board.snapshot(&c.id).await.unwrap().phase, Phase::Pending);

    let a_status = board.snapshot(&a.id).await.unwrap();
    assert!(a_status.last_error.is_some());
    assert!(a_status.retry_count >= 1);

    // A recovers on its retry interval; B proceeds and fails its health
    // wait within the timeout; C stays Pending behind B
    store.allow(&a_ref).await;
    assert!(wait_for_phase(&board, &a.id, Phase::Ready, Duration::from_secs(3)).await);
    assert!(wait_for_phase(&board, &b.id, Phase::Failed, Duration::from_secs(3)).await);
    assert_eq!(board.snapshot(&c.id).await.unwrap().phase, Phase::Pending);

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
}

#[tokio::test]
async fn test_chain_converges_when_everything_is_healthy() {
    let artifact = tempfile::tempdir().unwrap();
    write_manifest(artifact.path(), "apps/a/cm.yaml", &configmap_yaml("a"));
    write_manifest(artifact.path(), "apps/b/cm.yaml", &configmap_yaml("b"));
    write_manifest(artifact.path(), "apps/c/cm.yaml", &configmap_yaml("c"));

    let source = source_decl("repo", artifact.path().to_str().unwrap());
    let store = Arc::new(InMemoryStore::new());
    let ctx = context_with_artifact(Arc::clone(&store), resolver_without_key(), &source).await;

    let a = test_unit("a", "./apps/a", "repo", &[]);
    let b = test_unit("b", "./apps/b", "repo", &["a"]);
    let c = test_unit("c", "./apps/c", "repo", &["a", "b"]);

    let units = vec![a.clone(), b.clone(), c.clone()];
    let (scheduler, board) = scheduler_for(ctx, &units);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tasks = scheduler.spawn_all(units, &shutdown_rx);

    for unit in [&a, &b, &c] {
        assert!(
            wait_for_phase(&board, &unit.id, Phase::Ready, Duration::from_secs(3)).await,
            "unit {} did not become Ready",
            unit.id
        );
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
}

#[tokio::test]
async fn test_source_change_triggers_new_revision() {
    let artifact = tempfile::tempdir().unwrap();
    write_manifest(artifact.path(), "apps/web/cm.yaml", &configmap_yaml("web-v1"));

    let source = source_decl("repo", artifact.path().to_str().unwrap());
    let store = Arc::new(InMemoryStore::new());
    let ctx = context_with_artifact(Arc::clone(&store), resolver_without_key(), &source).await;

    let unit = test_unit("web", "./apps/web", "repo", &[]);
    let units = vec![unit.clone()];
    let (scheduler, board) = scheduler_for(ctx.clone(), &units);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tasks = scheduler.spawn_all(units, &shutdown_rx);

    assert!(wait_for_phase(&board, &unit.id, Phase::Ready, Duration::from_secs(2)).await);
    let first_revision = board
        .snapshot(&unit.id)
        .await
        .unwrap()
        .last_applied_revision
        .unwrap();

    // Change the artifact and surface the new revision; the unit's interval
    // is an hour, so only the source event can trigger the second pass
    write_manifest(artifact.path(), "apps/web/cm.yaml", &configmap_yaml("web-v2"));
    repoll_source(&ctx, &source).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let status = board.snapshot(&unit.id).await.unwrap();
        if status.last_applied_revision.as_deref() != Some(first_revision.as_str())
            && status.phase == Phase::Ready
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "unit never applied the new revision"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
}

#[tokio::test]
async fn test_upgrade_failures_stall_until_new_revision() {
    let artifact = tempfile::tempdir().unwrap();
    write_manifest(artifact.path(), "apps/web/cm.yaml", &configmap_yaml("web"));

    let source = source_decl("repo", artifact.path().to_str().unwrap());
    let store = Arc::new(InMemoryStore::new());
    let ctx = context_with_artifact(Arc::clone(&store), resolver_without_key(), &source).await;

    let mut unit = test_unit("web", "./apps/web", "repo", &[]);
    unit.retries = 1;

    let units = vec![unit.clone()];
    let (scheduler, board) = scheduler_for(ctx.clone(), &units);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tasks = scheduler.spawn_all(units, &shutdown_rx);

    // Install succeeds
    assert!(wait_for_phase(&board, &unit.id, Phase::Ready, Duration::from_secs(2)).await);

    // Break the store and push a new revision: the bounded upgrade budget
    // (one retry) is consumed, then the unit stalls
    let web_ref = ObjectRef::new("ConfigMap", "web", Some("default"));
    store.reject(web_ref.clone()).await;
    write_manifest(artifact.path(), "apps/web/cm.yaml", &configmap_yaml("web-broken"));
    repoll_source(&ctx, &source).await;

    assert!(wait_for_phase(&board, &unit.id, Phase::Stalled, Duration::from_secs(3)).await);
    let stalled = board.snapshot(&unit.id).await.unwrap();
    assert_eq!(stalled.retry_count, 2, "initial failure plus one retry");
    assert!(stalled.next_retry_time.is_none());

    // Only a new revision supersedes the stall
    store.allow(&web_ref).await;
    write_manifest(artifact.path(), "apps/web/cm.yaml", &configmap_yaml("web-fixed"));
    repoll_source(&ctx, &source).await;

    assert!(wait_for_phase(&board, &unit.id, Phase::Ready, Duration::from_secs(3)).await);

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
}

#[tokio::test]
async fn test_suspended_unit_never_reconciles() {
    let artifact = tempfile::tempdir().unwrap();
    write_manifest(artifact.path(), "apps/web/cm.yaml", &configmap_yaml("web"));

    let source = source_decl("repo", artifact.path().to_str().unwrap());
    let store = Arc::new(InMemoryStore::new());
    let ctx = context_with_artifact(Arc::clone(&store), resolver_without_key(), &source).await;

    let mut unit = test_unit("web", "./apps/web", "repo", &[]);
    unit.suspend = true;

    let units = vec![unit.clone()];
    let (scheduler, board) = scheduler_for(ctx, &units);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tasks = scheduler.spawn_all(units, &shutdown_rx);

    assert!(wait_for_phase(&board, &unit.id, Phase::Suspended, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.is_empty().await, "suspended units must not apply anything");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
}
