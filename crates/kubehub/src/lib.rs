//! depwatch kubehub: cluster client resolution, status reads, deployment
//! watch (raw and informer), managed reconciler and leader election.

#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod handler;
pub mod informer;
pub mod lease;
pub mod manager;
mod project;
pub mod reporter;
pub mod watch;

pub use client::{resolve, resolve_credentials, Credentials};
pub use error::{ClientError, QueryError, WatchError};
pub use handler::{render_change, ChangeHandler, ConsoleHandler};
pub use informer::{watch_deployments_with_informer, Informer, InformerState, DEFAULT_RESYNC};
pub use lease::{LeaderElection, LeaseConfig, LeaseError};
pub use manager::{run_manager, ManagerContext, DEFAULT_REQUEUE};
pub use project::{cluster_event, deployment_snapshot};
pub use reporter::{log_event, report_status, status_summary, ClusterReader, KubeReader};
pub use watch::{run_raw_watch, watch_deployments, WatchOutcome};
