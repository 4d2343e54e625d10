use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand};
use depwatch_core::{DEFAULT_EVENT_LIMIT, DEFAULT_NAMESPACE};
use depwatch_log::{fields, init_tracing, Logger, Mode};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "depwatchctl", version, about = "Kubernetes deployment status, watch and reconcile tool")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Namespace to monitor (manager: empty for all namespaces)
    #[arg(short = 'n', long = "namespace", global = true, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Path to kubeconfig (default: $KUBECONFIG, then ~/.kube/config)
    #[arg(short = 'k', long = "kubeconfig", global = true)]
    kubeconfig: Option<String>,

    /// Use the pod's service account instead of a kubeconfig
    #[arg(short = 'i', long = "in-cluster", global = true, env = "DEPWATCH_IN_CLUSTER", action = ArgAction::SetTrue)]
    in_cluster: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print deployment status and recent events once
    Status {
        /// Number of recent events to show (non-positive selects the default)
        #[arg(long = "events-limit", default_value_t = i64::from(DEFAULT_EVENT_LIMIT), allow_negative_numbers = true)]
        events_limit: i64,
        /// Keep watching deployments after the report
        #[arg(short = 'w', long = "watch", action = ArgAction::SetTrue)]
        watch: bool,
    },
    /// Watch deployments over a single raw watch stream (no reconnect)
    Watch,
    /// Report status, then watch deployments through a cached informer
    Controller {
        /// Seconds between informer resyncs
        #[arg(long = "resync-secs", default_value_t = 30)]
        resync_secs: u64,
        #[arg(long = "events-limit", default_value_t = i64::from(DEFAULT_EVENT_LIMIT), allow_negative_numbers = true)]
        events_limit: i64,
    },
    /// Serve the JSON API and static dashboard
    Server {
        #[arg(short = 'H', long = "host", default_value = "0.0.0.0")]
        host: String,
        #[arg(short = 'p', long = "port", default_value_t = 8080)]
        port: u16,
        /// Directory with dashboard assets; skipped when missing
        #[arg(long = "static-dir", default_value = "static")]
        static_dir: PathBuf,
    },
    /// Run the deployment reconciler with probes, metrics and optional leader election
    Manager(ManagerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ManagerArgs {
    #[arg(long = "leader-elect", action = ArgAction::SetTrue)]
    leader_elect: bool,
    #[arg(long = "leader-election-id", default_value = "depwatch")]
    leader_election_id: String,
    /// Namespace of the lease (default: $POD_NAMESPACE, then the watched namespace)
    #[arg(long = "lease-namespace")]
    lease_namespace: Option<String>,
    #[arg(long = "health-probe-bind-address", default_value = "0.0.0.0:8081")]
    health_probe_bind_address: String,
    /// Prometheus exporter address; empty disables metrics
    #[arg(long = "metrics-bind-address", default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,
    #[arg(long = "requeue-secs", default_value_t = 30)]
    requeue_secs: u64,
}

/// Cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = term.recv() => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl-C, shutting down");
}

async fn run(cli: Cli, log: &Logger) -> anyhow::Result<()> {
    let cancel = shutdown_token();
    let g = &cli.global;
    match cli.command {
        Commands::Status { events_limit, watch } => commands::status(g, events_limit, watch, log, cancel).await,
        Commands::Watch => commands::watch(g, log, cancel).await,
        Commands::Controller { resync_secs, events_limit } => {
            commands::controller(g, resync_secs, events_limit, log, cancel).await
        }
        Commands::Server { host, port, static_dir } => commands::server(g, &host, port, static_dir, log, cancel).await,
        Commands::Manager(args) => commands::manager(g, args, log, cancel).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mode = Mode::from_env();
    init_tracing(mode);
    let log = Logger::for_mode(mode);
    match run(cli, &log).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log.fatal("Command failed", Some(&e), fields!());
            ExitCode::FAILURE
        }
    }
}
