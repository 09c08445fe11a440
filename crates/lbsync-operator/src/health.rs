//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness), `/readyz` (readiness) and `/metrics`
//! (Prometheus text) endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::backend::BackendClient;

/// Default port for health check server.
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Shared state for health check endpoints.
pub struct HealthState {
    /// Set once the boot full sync finished.
    ready: Arc<AtomicBool>,
    client: Arc<dyn BackendClient>,
    metrics: Option<PrometheusHandle>,
}

impl HealthState {
    pub fn new(
        ready: Arc<AtomicBool>,
        client: Arc<dyn BackendClient>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            ready,
            client,
            metrics,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

/// Run the health check HTTP server.
///
/// Runs until the server encounters a fatal error; spawn it alongside the
/// queue workers.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> std::io::Result<()> {
    // Probes come from the kubelet inside the pod network namespace
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = port, "Health check server listening");

    axum::serve(listener, router(state)).await
}

/// Liveness probe endpoint.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe endpoint.
///
/// Returns 503 until the boot full sync finished, and whenever the backend
/// controller does not answer its readiness probe.
async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_synced() {
        debug!("Readiness probe: NOT READY (boot sync incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match state.client.check_readiness().await {
        Ok(true) => {
            debug!("Readiness probe: OK");
            StatusCode::OK
        }
        Ok(false) => {
            debug!("Readiness probe: NOT READY (controller not ready)");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(e) => {
            warn!(error = %e, "Readiness probe: NOT READY (controller unreachable)");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn render_metrics(State(state): State<Arc<HealthState>>) -> (StatusCode, String) {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}
