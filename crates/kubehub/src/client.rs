//! Cluster client resolution: in-cluster service account or kubeconfig file.

use std::ffi::OsStr;
use std::path::PathBuf;

use depwatch_log::{fields, Logger};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::error::ClientError;

pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// Where cluster credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    InCluster,
    Kubeconfig(PathBuf),
}

impl Credentials {
    pub fn auth_method(&self) -> &'static str {
        match self {
            Credentials::InCluster => "in_cluster",
            Credentials::Kubeconfig(_) => "kubeconfig",
        }
    }
}

/// Kubeconfig path precedence: explicit argument, then `KUBECONFIG` (first
/// entry), then `<home>/.kube/config`.
pub fn kubeconfig_path(explicit: Option<&str>, env: Option<&OsStr>, home: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(p) = explicit.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(p));
    }
    if let Some(p) = env.and_then(|v| std::env::split_paths(v).find(|p| !p.as_os_str().is_empty())) {
        return Some(p);
    }
    home.map(|h| h.join(".kube").join("config"))
}

pub fn resolve_credentials(in_cluster: bool, explicit: Option<&str>) -> Result<Credentials, ClientError> {
    if in_cluster {
        return Ok(Credentials::InCluster);
    }
    let env = std::env::var_os(KUBECONFIG_ENV);
    kubeconfig_path(explicit, env.as_deref(), home::home_dir())
        .map(Credentials::Kubeconfig)
        .ok_or(ClientError::NoKubeconfig)
}

/// Build an authenticated client. The returned handle is cheap to clone and
/// safe to share between watch sessions and HTTP handlers.
pub async fn resolve(in_cluster: bool, explicit: Option<&str>, log: &Logger) -> Result<Client, ClientError> {
    let creds = resolve_credentials(in_cluster, explicit)?;
    let config = match &creds {
        Credentials::InCluster => {
            log.debug("Using in-cluster config", fields!());
            Config::incluster()?
        }
        Credentials::Kubeconfig(path) => {
            log.debug("Loading kubeconfig", fields! { "kubeconfig_path" => path.display().to_string() });
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|source| ClientError::Kubeconfig { path: path.clone(), source })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|source| ClientError::Kubeconfig { path: path.clone(), source })?
        }
    };
    let client = Client::try_from(config)?;
    log.debug("Kubernetes client created successfully", fields! { "auth_method" => creds.auth_method() });
    Ok(client)
}
