#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::{TimeZone, Utc};
use depwatch_api::{router, AppState};
use depwatch_core::{ClusterEvent, DeploymentSnapshot, EventType};
use depwatch_kubehub::{ClusterReader, QueryError};
use depwatch_log::{Logger, MemorySink, Mode};
use serde_json::Value;
use tower::ServiceExt;

#[derive(Default)]
struct FakeCluster {
    deployments: HashMap<String, Vec<DeploymentSnapshot>>,
    events: HashMap<String, Vec<ClusterEvent>>,
    broken: bool,
}

#[async_trait::async_trait]
impl ClusterReader for FakeCluster {
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<DeploymentSnapshot>, QueryError> {
        if self.broken {
            return Err(QueryError::Backend("connection refused".into()));
        }
        Ok(self.deployments.get(namespace).cloned().unwrap_or_default())
    }

    async fn list_events(&self, namespace: &str, _limit: u32) -> Result<Vec<ClusterEvent>, QueryError> {
        // ignores the limit, like a server answering from its watch cache
        Ok(self.events.get(namespace).cloned().unwrap_or_default())
    }

    async fn list_pod_phases(&self, _namespace: &str) -> Result<Vec<Option<String>>, QueryError> {
        Ok(vec![Some("Running".into()), Some("Running".into()), Some("Pending".into()), None])
    }

    async fn count_services(&self, _namespace: &str) -> Result<usize, QueryError> {
        Ok(3)
    }
}

fn snap(name: &str, ready: i32, desired: i32) -> DeploymentSnapshot {
    DeploymentSnapshot {
        name: name.into(),
        namespace: "default".into(),
        desired_replicas: desired,
        ready_replicas: ready,
        available_replicas: ready,
        updated_replicas: desired,
    }
}

fn event(i: u32) -> ClusterEvent {
    ClusterEvent {
        event_type: if i % 2 == 0 { EventType::Normal } else { EventType::Warning },
        reason: format!("Reason{i}"),
        message: format!("message {i}"),
        involved_object: "web".into(),
        timestamp: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, i).unwrap()),
    }
}

fn app(cluster: FakeCluster) -> Router {
    let log = Logger::with_sink(Mode::Development, Arc::new(MemorySink::new()));
    router(AppState::new(Arc::new(cluster), log), None)
}

fn app_with_dashboard(cluster: FakeCluster, dir: &std::path::Path) -> Router {
    let log = Logger::with_sink(Mode::Development, Arc::new(MemorySink::new()));
    router(AppState::new(Arc::new(cluster), log), Some(dir.to_path_buf()))
}

fn populated() -> FakeCluster {
    let mut c = FakeCluster::default();
    c.deployments.insert("default".into(), vec![snap("web", 1, 3), snap("api", 2, 2)]);
    c.events.insert("default".into(), (0..5).map(event).collect());
    c
}

async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let req = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
    let res = app.oneshot(req).await.unwrap();
    let status = res.status();
    let headers = res.headers().clone();
    let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let (status, headers, body) = call(app, Method::GET, uri).await;
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_reports_success() {
    let (status, body) = get_json(app(FakeCluster::default()), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Server is healthy");
    assert!(body["data"]["timestamp"].is_string());
    assert!(body["data"]["version"].is_string());
}

#[tokio::test]
async fn deployments_carry_health_flag() {
    let (status, body) = get_json(app(populated()), "/api/v1/deployments").await;
    assert_eq!(status, StatusCode::OK);
    let data = &body["data"];
    assert_eq!(data["namespace"], "default");
    assert_eq!(data["count"], 2);
    let web = &data["deployments"][0];
    assert_eq!(web["name"], "web");
    assert_eq!(web["ready_replicas"], 1);
    assert_eq!(web["desired_replicas"], 3);
    assert_eq!(web["healthy"], false);
    assert_eq!(data["deployments"][1]["healthy"], true);
}

#[tokio::test]
async fn empty_namespace_is_not_an_error() {
    let (status, body) = get_json(app(populated()), "/api/v1/deployments?namespace=empty-ns").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["count"], 0);
    assert_eq!(body["data"]["deployments"], Value::Array(vec![]));
    assert_eq!(body["data"]["namespace"], "empty-ns");
}

#[tokio::test]
async fn events_respect_limit() {
    let (status, body) = get_json(app(populated()), "/api/v1/events?namespace=default&limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["count"].as_u64().unwrap() <= 2);
    let first = &body["data"]["events"][0];
    assert_eq!(first["type"], "Normal");
    assert_eq!(first["reason"], "Reason0");
    assert_eq!(first["object"], "web");
}

#[tokio::test]
async fn invalid_limit_falls_back_to_default() {
    let mut c = FakeCluster::default();
    c.events.insert("default".into(), (0..15).map(event).collect());
    for uri in ["/api/v1/events?limit=-5", "/api/v1/events?limit=0", "/api/v1/events?limit=abc"] {
        let (_, body) = get_json(app(FakeCluster { events: c.events.clone(), ..Default::default() }), uri).await;
        assert_eq!(body["data"]["count"], 10, "{uri}");
    }
}

#[tokio::test]
async fn status_aggregates_namespace() {
    let (status, body) = get_json(app(populated()), "/api/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    let data = &body["data"];
    assert_eq!(data["namespace"]["name"], "default");
    assert_eq!(data["deployments"]["total"], 2);
    assert_eq!(data["deployments"]["healthy"], 1);
    assert_eq!(data["deployments"]["unhealthy"], 1);
    assert_eq!(data["pods"]["total"], 4);
    assert_eq!(data["pods"]["status"]["Running"], 2);
    assert_eq!(data["pods"]["status"]["Unknown"], 1);
    assert_eq!(data["services"]["total"], 3);
}

#[tokio::test]
async fn backend_failure_uses_error_envelope() {
    let cluster = FakeCluster { broken: true, ..Default::default() };
    let (status, body) = get_json(app(cluster), "/api/v1/deployments").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Cluster query failed");
    assert!(body["message"].as_str().unwrap().contains("connection refused"));
    assert!(body.get("data").is_none());
}

#[tokio::test]
async fn unknown_path_is_json_404() {
    let (status, body) = get_json(app(populated()), "/api/v2/nothing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Endpoint not found");
    assert_eq!(body["message"], "The requested endpoint does not exist");
}

#[tokio::test]
async fn unsupported_method_is_json_404() {
    let (status, _, body) = call(app(populated()), Method::DELETE, "/api/v1/events").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn watch_endpoint_is_a_placeholder() {
    let (status, _, body) = call(app(populated()), Method::POST, "/api/v1/deployments").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["data"]["feature"], "deployment_watching");
    assert_eq!(body["data"]["status"], "not_implemented");
}

#[tokio::test]
async fn preflight_is_empty_200_with_cors() {
    let (status, headers, body) = call(app(populated()), Method::OPTIONS, "/api/v1/deployments").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(headers.get("access-control-allow-methods").unwrap(), "GET, POST, OPTIONS");
    assert_eq!(headers.get("access-control-allow-headers").unwrap(), "Content-Type");
}

#[tokio::test]
async fn repeated_query_parameters_keep_first_value() {
    let (status, body) = get_json(app(populated()), "/api/v1/events?limit=2&limit=3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["count"], 2);

    let (status, body) = get_json(app(populated()), "/api/v1/deployments?namespace=empty-ns&namespace=default").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["namespace"], "empty-ns");
    assert_eq!(body["data"]["count"], 0);

    let (status, body) = get_json(app(populated()), "/api/v1/status?namespace=default&namespace=other").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["namespace"]["name"], "default");
}

#[tokio::test]
async fn dashboard_files_are_served() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>depwatch</h1>").unwrap();
    let (status, _, body) = call(app_with_dashboard(populated(), dir.path()), Method::GET, "/index.html").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"<h1>depwatch</h1>");
}

#[tokio::test]
async fn dashboard_misses_are_json_404_for_any_method() {
    let dir = tempfile::tempdir().unwrap();
    for (method, uri) in [
        (Method::GET, "/nothing"),
        (Method::POST, "/api/v2/nothing"),
        (Method::DELETE, "/nothing"),
        (Method::PUT, "/index.html"),
    ] {
        let (status, headers, body) = call(app_with_dashboard(populated(), dir.path()), method.clone(), uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert_eq!(headers.get("content-type").unwrap(), "application/json", "{method} {uri}");
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Endpoint not found");
    }
}

#[tokio::test]
async fn api_routes_win_over_dashboard() {
    let dir = tempfile::tempdir().unwrap();
    let (status, _, body) = call(app_with_dashboard(populated(), dir.path()), Method::GET, "/api/v1/deployments").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["data"]["count"], 2);
}
