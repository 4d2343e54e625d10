//! depwatch HTTP surface.
//!
//! A small JSON API over the same reads the CLI reports on, plus an optional
//! static dashboard and the manager's probe endpoints. Every request re-runs
//! its cluster reads; nothing is cached here.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::handler::HandlerWithoutStateExt;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use depwatch_kubehub::ClusterReader;
use depwatch_log::{fields, Logger};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

mod handlers;
pub mod probe;
pub mod response;

pub use probe::{probe_router, serve_probes, ProbeState};
pub use response::{ApiError, ApiResponse};

/// Shared by every request handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub reader: Arc<dyn ClusterReader>,
    pub log: Logger,
}

impl AppState {
    pub fn new(reader: Arc<dyn ClusterReader>, log: Logger) -> Self {
        Self { reader, log }
    }
}

/// Build the API router. With `static_dir`, unmatched GET/HEAD paths are
/// served from that directory; everything else falls through to the JSON 404.
pub fn router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health).fallback(handlers::not_found))
        .route(
            "/api/v1/deployments",
            get(handlers::list_deployments).post(handlers::watch_placeholder).fallback(handlers::not_found),
        )
        .route("/api/v1/events", get(handlers::list_events).fallback(handlers::not_found))
        .route("/api/v1/status", get(handlers::cluster_status).fallback(handlers::not_found));
    let api = match static_dir {
        Some(dir) => api.fallback_service(
            ServeDir::new(dir)
                .call_fallback_on_method_not_allowed(true)
                .not_found_service(handlers::not_found.into_service()),
        ),
        None => api.fallback(handlers::not_found),
    };
    api.layer(middleware::from_fn_with_state(state.clone(), cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Permissive CORS on every response; preflight requests short-circuit with an empty 200.
async fn cors(State(state): State<AppState>, req: Request, next: Next) -> Response {
    state.log.debug("HTTP request", fields! { "method" => req.method().as_str(), "path" => req.uri().path() });
    let mut res = if req.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(req).await
    };
    let headers = res.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, POST, OPTIONS"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
    res
}

/// Bind `addr` and serve `app` until `cancel` fires.
pub async fn serve(addr: SocketAddr, app: Router, log: &Logger, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log.info("HTTP server started successfully", fields! { "address" => addr.to_string() });
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
