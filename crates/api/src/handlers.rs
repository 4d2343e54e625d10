use axum::async_trait;
use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use depwatch_core::{parse_event_limit, ClusterEvent, DeploymentSnapshot, DEFAULT_NAMESPACE};
use depwatch_kubehub::{log_event, status_summary};
use depwatch_log::fields;
use serde::Serialize;
use serde_json::{json, Value};

use crate::response::{ApiError, ApiResponse};
use crate::AppState;

const API_VERSION: &str = "1.0.0";

/// `?namespace=` and `?limit=`. A repeated parameter keeps its first value,
/// unknown parameters are ignored.
#[derive(Debug, Default)]
pub struct ScopeQuery {
    namespace: Option<String>,
    limit: Option<String>,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ScopeQuery {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(pairs) = Query::<Vec<(String, String)>>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::bad_request("Invalid query string", &e.body_text()))?;
        Ok(Self::from_pairs(pairs))
    }
}

impl ScopeQuery {
    fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut q = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_str() {
                "namespace" => &mut q.namespace,
                "limit" => &mut q.limit,
                _ => continue,
            };
            slot.get_or_insert(value);
        }
        q
    }

    fn namespace(&self) -> &str {
        self.namespace.as_deref().filter(|ns| !ns.is_empty()).unwrap_or(DEFAULT_NAMESPACE)
    }
}

#[derive(Debug, Serialize)]
pub struct HealthData {
    timestamp: DateTime<Utc>,
    version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DeploymentView {
    #[serde(flatten)]
    snapshot: DeploymentSnapshot,
    healthy: bool,
}

impl From<DeploymentSnapshot> for DeploymentView {
    fn from(snapshot: DeploymentSnapshot) -> Self {
        let healthy = snapshot.is_healthy();
        Self { snapshot, healthy }
    }
}

#[derive(Debug, Serialize)]
pub struct DeploymentList {
    deployments: Vec<DeploymentView>,
    namespace: String,
    count: usize,
}

#[derive(Debug, Serialize)]
pub struct EventView {
    #[serde(rename = "type")]
    event_type: String,
    reason: String,
    message: String,
    timestamp: Option<DateTime<Utc>>,
    object: String,
}

impl From<&ClusterEvent> for EventView {
    fn from(e: &ClusterEvent) -> Self {
        Self {
            event_type: e.event_type.as_str().to_string(),
            reason: e.reason.clone(),
            message: e.message.clone(),
            timestamp: e.timestamp,
            object: e.involved_object.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventList {
    events: Vec<EventView>,
    namespace: String,
    count: usize,
}

#[derive(Debug, Serialize)]
pub struct Placeholder {
    feature: &'static str,
    status: &'static str,
}

pub async fn health() -> ApiResponse<HealthData> {
    ApiResponse::ok(HealthData { timestamp: Utc::now(), version: API_VERSION }).with_message("Server is healthy")
}

pub async fn list_deployments(
    State(state): State<AppState>,
    q: ScopeQuery,
) -> Result<ApiResponse<DeploymentList>, ApiError> {
    let namespace = q.namespace();
    let log = state.log.with_namespace(namespace);
    log.info("HTTP request: Get deployments", fields! { "namespace" => namespace });

    let deployments = state.reader.list_deployments(namespace).await.map_err(|e| {
        log.error("Failed to get deployments", Some(&e), fields!());
        ApiError::from(e)
    })?;
    for d in &deployments {
        log.with_deployment(&d.name).info(
            "Deployment status retrieved",
            fields! {
                "ready_replicas" => d.ready_replicas,
                "desired_replicas" => d.desired_replicas,
                "available_replicas" => d.available_replicas,
                "healthy" => d.is_healthy(),
            },
        );
    }
    let deployments: Vec<DeploymentView> = deployments.into_iter().map(DeploymentView::from).collect();
    Ok(ApiResponse::ok(DeploymentList { count: deployments.len(), deployments, namespace: namespace.to_string() }))
}

pub async fn list_events(
    State(state): State<AppState>,
    q: ScopeQuery,
) -> Result<ApiResponse<EventList>, ApiError> {
    let namespace = q.namespace();
    let limit = parse_event_limit(q.limit.as_deref());
    let log = state.log.with_namespace(namespace);
    log.info("HTTP request: Get events", fields! { "namespace" => namespace, "limit" => limit });

    let events = state.reader.list_events(namespace, limit).await.map_err(|e| {
        log.error("Failed to get events", Some(&e), fields!());
        ApiError::from(e)
    })?;
    let events: Vec<EventView> = events
        .iter()
        .take(limit as usize)
        .inspect(|e| log_event(&log, e))
        .map(EventView::from)
        .collect();
    Ok(ApiResponse::ok(EventList { count: events.len(), events, namespace: namespace.to_string() }))
}

pub async fn cluster_status(State(state): State<AppState>, q: ScopeQuery) -> Result<ApiResponse<Value>, ApiError> {
    let namespace = q.namespace();
    let log = state.log.with_namespace(namespace);
    log.info("HTTP request: Get cluster status", fields! { "namespace" => namespace });

    let s = status_summary(state.reader.as_ref(), namespace).await.map_err(|e| {
        log.error("Failed to get cluster status", Some(&e), fields!());
        ApiError::from(e)
    })?;
    Ok(ApiResponse::ok(json!({
        "namespace": { "name": s.namespace },
        "deployments": {
            "total": s.deployments_total,
            "healthy": s.deployments_healthy,
            "unhealthy": s.deployments_unhealthy,
        },
        "pods": { "total": s.pods_total, "status": s.pod_phases },
        "services": { "total": s.services_total },
        "timestamp": Utc::now(),
    })))
}

/// Streaming deployment updates over HTTP are not offered; the route answers
/// with a fixed descriptor so dashboard clients can feature-detect.
pub async fn watch_placeholder() -> ApiResponse<Placeholder> {
    ApiResponse::ok(Placeholder { feature: "deployment_watching", status: "not_implemented" })
        .with_message("Watch endpoint - use the watch or controller command for real-time updates")
}

pub async fn not_found() -> ApiError {
    ApiError::not_found()
}
