//! # HTTP Server
//!
//! HTTP server for metrics, health checks, and per-unit status.
//!
//! Provides endpoints:
//! - `/metrics` - Prometheus metrics in text format
//! - `/healthz` - Liveness probe (always returns 200)
//! - `/readyz` - Readiness probe (returns 200 when the engine is running)
//! - `/status` - Status snapshot per unit (phase, last error, retry count)
//!
//! The server runs on port 5000 by default (configurable via `METRICS_PORT`
//! environment variable or the `--metrics-port` flag).

use crate::observability::metrics;
use crate::reconciler::StatusBoard;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub struct ServerState {
    pub is_ready: Arc<std::sync::atomic::AtomicBool>,
    pub board: Arc<StatusBoard>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState").finish_non_exhaustive()
    }
}

pub async fn start_server(port: u16, state: Arc<ServerState>) -> Result<(), anyhow::Error> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("Failed to encode metrics: {}", e).into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.is_ready.load(std::sync::atomic::Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Per-unit status snapshots keyed by `namespace/name`. This is the
/// queryable surface for last error and retry count.
async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let mut body = serde_json::Map::new();
    for (id, status) in state.board.all().await {
        match serde_json::to_value(&status) {
            Ok(value) => {
                body.insert(id.to_string(), value);
            }
            Err(e) => {
                error!("Failed to serialize status for {}: {}", id, e);
            }
        }
    }

    Json(serde_json::Value::Object(body))
}
