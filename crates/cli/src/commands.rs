use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use depwatch_api::{router, serve, serve_probes, AppState, ProbeState};
use depwatch_core::clamp_event_limit;
use depwatch_kubehub::lease::{default_holder_id, DEFAULT_LEASE_DURATION, DEFAULT_RENEW_INTERVAL};
use depwatch_kubehub::{
    report_status, resolve, run_manager, watch_deployments, watch_deployments_with_informer, ClusterReader,
    ConsoleHandler, KubeReader, LeaderElection, LeaseConfig, LeaseError, ManagerContext,
};
use depwatch_log::{fields, Logger};
use kube::Client;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{GlobalArgs, ManagerArgs};

async fn connect(g: &GlobalArgs, log: &Logger) -> Result<Client> {
    resolve(g.in_cluster, g.kubeconfig.as_deref(), log)
        .await
        .context("Failed to get Kubernetes client")
}

fn startup(g: &GlobalArgs, log: &Logger, message: &str) -> Logger {
    let nslog = log.with_namespace(&g.namespace);
    nslog.info(
        message,
        fields! { "in_cluster" => g.in_cluster, "kubeconfig" => g.kubeconfig.as_deref().unwrap_or_default() },
    );
    nslog
}

async fn report(client: &Client, g: &GlobalArgs, events_limit: i64, log: &Logger) -> Result<()> {
    let reader = KubeReader::new(client.clone());
    let mut out = std::io::stdout();
    report_status(&reader, &g.namespace, clamp_event_limit(events_limit), log, &mut out)
        .await
        .context("Failed to write status report")
}

async fn raw_watch(client: Client, g: &GlobalArgs, log: &Logger, cancel: CancellationToken) -> Result<()> {
    println!("\nWatching for deployment changes in namespace {} (Ctrl-C to stop)...", g.namespace);
    let handler = ConsoleHandler::new(log.clone());
    watch_deployments(client, &g.namespace, &handler, log, &cancel).await?;
    Ok(())
}

pub async fn status(g: &GlobalArgs, events_limit: i64, watch: bool, log: &Logger, cancel: CancellationToken) -> Result<()> {
    let nslog = startup(g, log, "Starting Kubernetes Controller");
    let client = connect(g, log).await?;
    report(&client, g, events_limit, &nslog).await?;
    if watch {
        raw_watch(client, g, &nslog, cancel).await?;
    }
    Ok(())
}

pub async fn watch(g: &GlobalArgs, log: &Logger, cancel: CancellationToken) -> Result<()> {
    let nslog = startup(g, log, "Starting deployment watch");
    let client = connect(g, log).await?;
    raw_watch(client, g, &nslog, cancel).await
}

pub async fn controller(
    g: &GlobalArgs,
    resync_secs: u64,
    events_limit: i64,
    log: &Logger,
    cancel: CancellationToken,
) -> Result<()> {
    let nslog = startup(g, log, "Starting Kubernetes Controller");
    let client = connect(g, log).await?;
    report(&client, g, events_limit, &nslog).await?;

    nslog.info("Starting deployment informer", fields! { "resync_secs" => resync_secs });
    println!("\nWatching for deployment changes in namespace {} (Ctrl-C to stop)...", g.namespace);
    let handler = ConsoleHandler::new(nslog.clone());
    watch_deployments_with_informer(client, &g.namespace, Duration::from_secs(resync_secs), &handler, &nslog, cancel)
        .await
        .context("Deployment informer failed")
}

pub async fn server(
    g: &GlobalArgs,
    host: &str,
    port: u16,
    static_dir: PathBuf,
    log: &Logger,
    cancel: CancellationToken,
) -> Result<()> {
    log.info("Starting HTTP server", fields! { "host" => host, "port" => port });
    let client = connect(g, log).await?;
    let reader: Arc<dyn ClusterReader> = Arc::new(KubeReader::new(client));

    let static_dir = if static_dir.is_dir() {
        Some(static_dir)
    } else {
        log.debug("Static directory not found, dashboard disabled", fields! { "static_dir" => static_dir.display().to_string() });
        None
    };
    let app = router(AppState::new(reader, log.clone()), static_dir);

    let addr = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow!("no address for {host}:{port}"))?;
    serve(addr, app, log, cancel)
        .await
        .with_context(|| format!("HTTP server on {addr} failed"))
}

fn install_metrics(addr: &str, log: &Logger) -> Result<()> {
    if addr.is_empty() {
        log.debug("Metrics exporter disabled", fields!());
        return Ok(());
    }
    let sock: SocketAddr = addr.parse().with_context(|| format!("invalid metrics address {addr}"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(sock)
        .install()
        .context("Failed to install metrics exporter")?;
    log.info("Prometheus metrics exporter listening", fields! { "address" => addr });
    Ok(())
}

fn lease_namespace(args: &ManagerArgs, g: &GlobalArgs) -> String {
    args.lease_namespace
        .clone()
        .or_else(|| std::env::var("POD_NAMESPACE").ok())
        .filter(|ns| !ns.is_empty())
        .or_else(|| Some(g.namespace.clone()).filter(|ns| !ns.is_empty()))
        .unwrap_or_else(|| depwatch_core::DEFAULT_NAMESPACE.to_string())
}

type Renewal = JoinHandle<Result<(), LeaseError>>;

async fn renewal_ended(renewal: Option<&mut Renewal>) -> Result<Result<(), LeaseError>, JoinError> {
    match renewal {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

pub async fn manager(g: &GlobalArgs, args: ManagerArgs, log: &Logger, cancel: CancellationToken) -> Result<()> {
    let watch_ns = Some(g.namespace.as_str()).filter(|ns| !ns.is_empty());
    log.info(
        "Starting controller manager",
        fields! {
            "namespace" => watch_ns.unwrap_or(""),
            "in_cluster" => g.in_cluster,
            "leader_election" => args.leader_elect,
            "leader_election_id" => args.leader_election_id.as_str(),
            "metrics_address" => args.metrics_bind_address.as_str(),
            "health_address" => args.health_probe_bind_address.as_str(),
        },
    );
    let client = connect(g, log).await?;

    let probes = Arc::new(ProbeState::new());
    let probe_addr: SocketAddr = args
        .health_probe_bind_address
        .parse()
        .with_context(|| format!("invalid probe address {}", args.health_probe_bind_address))?;
    let probe_task = tokio::spawn(serve_probes(probe_addr, probes.clone(), cancel.clone()));
    install_metrics(&args.metrics_bind_address, log)?;

    let renew_stop = CancellationToken::new();
    let mut renewal: Option<Renewal> = None;
    if args.leader_elect {
        let config = LeaseConfig::new(
            args.leader_election_id.clone(),
            lease_namespace(&args, g),
            default_holder_id(),
            DEFAULT_LEASE_DURATION,
            DEFAULT_RENEW_INTERVAL,
        )?;
        log.info(
            "Waiting for leadership",
            fields! { "lease" => config.lease_name(), "lease_namespace" => config.namespace(), "holder" => config.holder_id() },
        );
        let election = LeaderElection::new(client.clone(), config);
        if !election.acquire(&cancel).await {
            log.info("Shutdown requested before leadership was acquired", fields!());
            return Ok(());
        }
        renewal = Some(election.spawn_renewal(renew_stop.clone()));
    }

    probes.mark_started();
    let ctx = Arc::new(ManagerContext::new(log.clone(), Duration::from_secs(args.requeue_secs)));
    let stop = cancel.child_token();
    let lost = tokio::select! {
        _ = run_manager(client, watch_ns, ctx, stop.clone()) => None,
        res = renewal_ended(renewal.as_mut()) => Some(res),
    };
    probes.mark_stopped();
    stop.cancel();

    let res = match lost {
        Some(res) => res.context("lease renewal task failed")?.context("leader election"),
        None => {
            renew_stop.cancel();
            match renewal {
                Some(handle) => handle.await.context("lease renewal task failed")?.context("leader election"),
                None => Ok(()),
            }
        }
    };
    if let Ok(Err(e)) = probe_task.await {
        log.warn("Probe server stopped with error", fields! { "error" => e.to_string() });
    }
    log.info("Manager stopped", fields!());
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn globals(ns: &str) -> GlobalArgs {
        GlobalArgs { namespace: ns.to_string(), kubeconfig: None, in_cluster: false }
    }

    fn manager_args(lease_ns: Option<&str>) -> ManagerArgs {
        ManagerArgs {
            leader_elect: true,
            leader_election_id: "depwatch".into(),
            lease_namespace: lease_ns.map(str::to_string),
            health_probe_bind_address: "127.0.0.1:0".into(),
            metrics_bind_address: String::new(),
            requeue_secs: 30,
        }
    }

    #[test]
    fn explicit_lease_namespace_wins() {
        assert_eq!(lease_namespace(&manager_args(Some("ops")), &globals("")), "ops");
    }

    #[test]
    fn lease_namespace_falls_back_to_watched_namespace() {
        if std::env::var_os("POD_NAMESPACE").is_none() {
            assert_eq!(lease_namespace(&manager_args(None), &globals("team-a")), "team-a");
            assert_eq!(lease_namespace(&manager_args(None), &globals("")), "default");
        }
    }

    #[test]
    fn empty_metrics_address_disables_exporter() {
        let log = Logger::with_sink(depwatch_log::Mode::Development, Arc::new(depwatch_log::MemorySink::new()));
        assert!(install_metrics("", &log).is_ok());
        assert!(install_metrics("not-an-address", &log).is_err());
    }
}
