//! Liveness and readiness probes for the manager.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct ProbeState {
    started: AtomicBool,
}

impl ProbeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once the controller runs (and, with leader election, holds the lease).
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Probe: manager marked as started");
    }

    pub fn mark_stopped(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

pub fn probe_router(state: Arc<ProbeState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<ProbeState>>) -> StatusCode {
    if state.is_started() {
        StatusCode::OK
    } else {
        debug!("Readiness probe: not ready");
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn serve_probes(addr: SocketAddr, state: Arc<ProbeState>, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Probe server listening");
    axum::serve(listener, probe_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readiness_follows_started_flag() {
        let state = Arc::new(ProbeState::new());
        assert_eq!(healthz().await, StatusCode::OK);
        assert_eq!(readyz(State(state.clone())).await, StatusCode::SERVICE_UNAVAILABLE);
        state.mark_started();
        assert_eq!(readyz(State(state.clone())).await, StatusCode::OK);
        state.mark_stopped();
        assert_eq!(readyz(State(state)).await, StatusCode::SERVICE_UNAVAILABLE);
    }
}
