use std::path::PathBuf;

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Cluster access could not be resolved or authenticated.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to load in-cluster config: {0}")]
    InCluster(#[from] kube::config::InClusterError),
    #[error("failed to load kubeconfig {}: {source}", path.display())]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: kube::config::KubeconfigError,
    },
    #[error("no kubeconfig path: pass --kubeconfig, set KUBECONFIG or provide a home directory")]
    NoKubeconfig,
    #[error("failed to create Kubernetes client: {0}")]
    Client(#[from] kube::Error),
}

/// A single list call failed.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to list {resource} in namespace {namespace}: {source}")]
    List {
        resource: &'static str,
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[error("cluster query failed: {0}")]
    Backend(String),
}

impl QueryError {
    pub(crate) fn list(resource: &'static str, namespace: &str, source: kube::Error) -> Self {
        Self::List { resource, namespace: namespace.to_string(), source }
    }
}

/// Watch and informer failures. A clean stream close is not an error.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to open deployment watch in namespace {namespace}: {source}")]
    Open {
        namespace: String,
        #[source]
        source: kube::Error,
    },
    #[error("watch stream failed: {0}")]
    Stream(#[source] BoxError),
    #[error("informer cache failed to sync: {0}")]
    SyncFailed(#[source] BoxError),
}
