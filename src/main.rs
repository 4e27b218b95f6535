//! # GitOps Reconciler
//!
//! Controller binary: loads unit and source declarations, validates the
//! dependency graph, and drives continuous reconciliation against the
//! resource store, with metrics and health probes on an HTTP port.

use anyhow::{Context, Result};
use clap::Parser;
use gitops_reconciler::constants;
use gitops_reconciler::observability::metrics;
use gitops_reconciler::reconciler::{ReconcileContext, StatusBoard};
use gitops_reconciler::scheduler::Scheduler;
use gitops_reconciler::sealed::{KeySource, SecretResolver};
use gitops_reconciler::server::{start_server, ServerState};
use gitops_reconciler::source::{ArtifactFetcher, FilesystemFetcher, SourceTracker};
use gitops_reconciler::store::InMemoryStore;
use gitops_reconciler::{load_declarations, DependencyGraph};
use regex::Regex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "gitops-reconciler",
    about = "Converges declarative manifest sets against a resource store"
)]
struct Args {
    /// Directory containing unit and source declaration YAML files
    #[arg(long, default_value = "./declarations")]
    declarations: PathBuf,

    /// age key file used to decrypt sealed secrets (one identity per line).
    /// Without it, units with sealed documents fail until a key is provided.
    #[arg(long)]
    decryption_key: Option<PathBuf>,

    /// Process-wide pattern selecting which document fields hold ciphertext
    #[arg(long, default_value = constants::DEFAULT_SEALED_FIELD_PATTERN)]
    sealed_field_pattern: String,

    /// Port for the metrics/probe/status HTTP server
    #[arg(long, env = "METRICS_PORT", default_value_t = constants::DEFAULT_METRICS_PORT)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    metrics::register();

    // Load and validate declarations; any configuration error is fatal here
    // and no unit reconciles
    let declarations = load_declarations(&args.declarations)
        .with_context(|| format!("loading declarations from {}", args.declarations.display()))?;
    info!(
        units = declarations.units.len(),
        sources = declarations.sources.len(),
        "declarations loaded"
    );

    let graph = Arc::new(DependencyGraph::build(&declarations.units)?);
    info!(
        order = %graph
            .reconcile_order()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        "reconcile order resolved"
    );

    let sealed_pattern = Regex::new(&args.sealed_field_pattern)
        .with_context(|| format!("invalid sealed-field pattern '{}'", args.sealed_field_pattern))?;

    let key = match &args.decryption_key {
        Some(path) => {
            let key = KeySource::from_file("decryption-key", path)
                .with_context(|| format!("loading key material from {}", path.display()))?;
            info!("✅ Decryption key material loaded from {}", path.display());
            Some(key)
        }
        None => {
            warn!("⚠️  No decryption key configured - sealed documents will fail to decrypt");
            None
        }
    };

    let store = Arc::new(InMemoryStore::new());
    let sources = Arc::new(SourceTracker::new());
    let secrets = Arc::new(SecretResolver::new(sealed_pattern, key));

    let ctx = ReconcileContext {
        store,
        sources: Arc::clone(&sources),
        secrets,
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Source tracking tasks first so the initial reconcile passes find
    // artifacts
    let fetcher: Arc<dyn ArtifactFetcher> = Arc::new(FilesystemFetcher::new());
    let mut tasks = Vec::new();
    for source in declarations.sources.clone() {
        tasks.push(sources.spawn(source, Arc::clone(&fetcher), shutdown_rx.clone()));
    }

    let board = Arc::new(StatusBoard::new());
    let scheduler = Scheduler::new(graph, Arc::clone(&board), ctx);
    tasks.extend(scheduler.spawn_all(declarations.units, &shutdown_rx));

    let is_ready = Arc::new(AtomicBool::new(false));
    let server_state = Arc::new(ServerState {
        is_ready: Arc::clone(&is_ready),
        board,
    });
    let server = tokio::spawn(start_server(args.metrics_port, server_state));

    is_ready.store(true, Ordering::Relaxed);
    info!("engine started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received, stopping unit tasks");

    let _ = shutdown_tx.send(true);
    futures::future::join_all(tasks).await;
    server.abort();

    info!("engine stopped");
    Ok(())
}
