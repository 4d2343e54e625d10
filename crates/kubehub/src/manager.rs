//! Managed reconciler: a kube-runtime `Controller` over Deployments that logs
//! each deployment's rollout status and requeues on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use depwatch_log::{fields, Logger};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::project::deployment_snapshot;

pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue delay after a failed reconcile.
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

pub struct ManagerContext {
    pub log: Logger,
    pub requeue: Duration,
}

impl ManagerContext {
    pub fn new(log: Logger, requeue: Duration) -> Self {
        Self { log, requeue }
    }
}

pub async fn reconcile(deployment: Arc<Deployment>, ctx: Arc<ManagerContext>) -> Result<Action, ReconcileError> {
    let name = deployment.metadata.name.as_deref().ok_or(ReconcileError::MissingField("metadata.name"))?;
    let namespace = deployment.metadata.namespace.as_deref().unwrap_or_default();
    let snap = deployment_snapshot(&deployment);
    let log = ctx.log.with_namespace(namespace).with_deployment(name);

    metrics::counter!("depwatch_reconciles_total", 1u64, "healthy" => if snap.is_healthy() { "true" } else { "false" });
    log.info(
        "Deployment status",
        fields! {
            "ready_replicas" => snap.ready_replicas,
            "desired_replicas" => snap.desired_replicas,
            "available_replicas" => snap.available_replicas,
            "updated_replicas" => snap.updated_replicas,
            "generation" => deployment.metadata.generation,
            "observed_generation" => deployment.status.as_ref().and_then(|s| s.observed_generation),
        },
    );
    if snap.is_healthy() {
        log.info("Deployment is healthy", fields! { "replicas" => snap.ready_replicas });
    } else {
        log.warn(
            "Deployment is not healthy",
            fields! { "ready_replicas" => snap.ready_replicas, "desired_replicas" => snap.desired_replicas },
        );
    }
    Ok(Action::requeue(ctx.requeue))
}

pub fn error_policy(deployment: Arc<Deployment>, err: &ReconcileError, ctx: Arc<ManagerContext>) -> Action {
    let name = deployment.metadata.name.as_deref().unwrap_or("unknown");
    ctx.log
        .with_deployment(name)
        .error("Reconcile failed", Some(err), fields! { "retry_secs" => ERROR_REQUEUE.as_secs() });
    Action::requeue(ERROR_REQUEUE)
}

/// Run the deployment controller until `cancel` fires. `None` watches every namespace.
pub async fn run_manager(client: Client, namespace: Option<&str>, ctx: Arc<ManagerContext>, cancel: CancellationToken) {
    let api: Api<Deployment> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    ctx.log.info(
        "Starting deployment controller",
        fields! { "scope" => namespace.unwrap_or("all namespaces"), "requeue_secs" => ctx.requeue.as_secs() },
    );
    let controller = Controller::new(api, WatcherConfig::default())
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(object = %obj.name, "Reconciled"),
                Err(e) => error!(error = ?e, "Deployment controller stream error"),
            }
        });
    tokio::select! {
        _ = controller => ctx.log.warn("Deployment controller stream ended", fields!()),
        _ = cancel.cancelled() => ctx.log.info("Deployment controller stopped", fields!()),
    }
}
