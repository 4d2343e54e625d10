//! One-shot reads of deployments, events, pods and services, plus the
//! console/log rendering of a namespace status report.

use std::io::{self, Write};

use depwatch_core::{ClusterEvent, DeploymentSnapshot, EventType, StatusSummary};
use depwatch_log::{fields, Logger};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Pod, Service};
use kube::api::{Api, ListParams};
use kube::Client;

use crate::error::QueryError;
use crate::project::{cluster_event, deployment_snapshot};

/// Read-only access to the cluster state the reporter and the HTTP surface need.
#[async_trait::async_trait]
pub trait ClusterReader: Send + Sync {
    /// An empty namespace is a valid, empty result.
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<DeploymentSnapshot>, QueryError>;

    /// At most `limit` events, in API order.
    async fn list_events(&self, namespace: &str, limit: u32) -> Result<Vec<ClusterEvent>, QueryError>;

    /// Phase of every pod (`None` when unreported).
    async fn list_pod_phases(&self, namespace: &str) -> Result<Vec<Option<String>>, QueryError>;

    async fn count_services(&self, namespace: &str) -> Result<usize, QueryError>;
}

/// [`ClusterReader`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeReader {
    client: Client,
}

impl KubeReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ClusterReader for KubeReader {
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<DeploymentSnapshot>, QueryError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| QueryError::list("deployments", namespace, e))?;
        Ok(list.items.iter().map(deployment_snapshot).collect())
    }

    async fn list_events(&self, namespace: &str, limit: u32) -> Result<Vec<ClusterEvent>, QueryError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().limit(limit))
            .await
            .map_err(|e| QueryError::list("events", namespace, e))?;
        // the server may ignore `limit` (e.g. when served from the watch cache)
        Ok(list.items.iter().take(limit as usize).map(cluster_event).collect())
    }

    async fn list_pod_phases(&self, namespace: &str) -> Result<Vec<Option<String>>, QueryError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| QueryError::list("pods", namespace, e))?;
        Ok(list.items.into_iter().map(|p| p.status.and_then(|s| s.phase)).collect())
    }

    async fn count_services(&self, namespace: &str) -> Result<usize, QueryError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| QueryError::list("services", namespace, e))?;
        Ok(list.items.len())
    }
}

/// Deployment health counts, pod phase histogram and service count for a namespace.
pub async fn status_summary(reader: &dyn ClusterReader, namespace: &str) -> Result<StatusSummary, QueryError> {
    let deployments = reader.list_deployments(namespace).await?;
    let phases = reader.list_pod_phases(namespace).await?;
    let services = reader.count_services(namespace).await?;
    Ok(StatusSummary::tally(namespace, &deployments, phases.iter().map(|p| p.as_deref()), services))
}

/// Log one event at a level matching its type, in the involved object's context.
pub fn log_event(log: &Logger, event: &ClusterEvent) {
    let log = log.with_deployment(&event.involved_object);
    let fields = fields! {
        "event_type" => event.event_type.as_str(),
        "event_reason" => event.reason.as_str(),
        "event_message" => event.message.as_str(),
        "timestamp" => event.timestamp,
    };
    match event.event_type {
        EventType::Warning => log.warn("Kubernetes event", fields),
        EventType::Normal => log.debug("Kubernetes event", fields),
        EventType::Other(_) => log.info("Kubernetes event", fields),
    }
}

fn write_deployment(out: &mut dyn Write, d: &DeploymentSnapshot) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "Deployment: {}", d.name)?;
    writeln!(
        out,
        "  Replicas: {} (Available: {}, Ready: {}, Updated: {}) {}",
        d.replica_ratio(),
        d.available_replicas,
        d.ready_replicas,
        d.updated_replicas,
        if d.is_healthy() { "healthy" } else { "unhealthy" }
    )
}

fn write_event(out: &mut dyn Write, e: &ClusterEvent) -> io::Result<()> {
    let ts = e
        .timestamp
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    writeln!(out, "[{}] {}: {}", ts, e.reason, e.message)
}

/// Print the deployment section then the recent events section.
///
/// A failed query is logged and its section skipped; the rest of the report
/// still runs. Only console write failures are returned.
pub async fn report_status(
    reader: &dyn ClusterReader,
    namespace: &str,
    event_limit: u32,
    log: &Logger,
    out: &mut dyn Write,
) -> io::Result<()> {
    log.info("Fetching deployment status", fields!());
    match reader.list_deployments(namespace).await {
        Ok(deployments) => {
            log.info("Deployment status retrieved", fields! { "deployment_count" => deployments.len() });
            writeln!(out, "DEPLOYMENT STATUS")?;
            writeln!(out, "=================")?;
            for d in &deployments {
                let dlog = log.with_deployment(&d.name);
                dlog.info(
                    "Deployment status",
                    fields! {
                        "ready_replicas" => d.ready_replicas,
                        "desired_replicas" => d.desired_replicas,
                        "available_replicas" => d.available_replicas,
                        "updated_replicas" => d.updated_replicas,
                        "healthy" => d.is_healthy(),
                    },
                );
                write_deployment(out, d)?;
                if !d.is_healthy() {
                    dlog.warn(
                        "Deployment has fewer ready replicas than desired",
                        fields! { "ready_replicas" => d.ready_replicas, "desired_replicas" => d.desired_replicas },
                    );
                }
            }
        }
        Err(e) => log.error("Failed to get deployments", Some(&e), fields!()),
    }

    log.info("Fetching recent events", fields!());
    match reader.list_events(namespace, event_limit).await {
        Ok(events) => {
            log.info("Events retrieved", fields! { "event_count" => events.len() });
            writeln!(out)?;
            writeln!(out, "RECENT EVENTS")?;
            writeln!(out, "=============")?;
            for e in &events {
                write_event(out, e)?;
                log_event(log, e);
            }
        }
        Err(e) => log.error("Failed to get events", Some(&e), fields!()),
    }
    out.flush()
}
