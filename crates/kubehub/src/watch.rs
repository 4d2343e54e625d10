//! Raw watch: a single watch stream, no cache, no resync, no reconnect.
//!
//! Events missed while the connection is down are lost. The session ends on
//! stream close, cancellation or the first read error.

use depwatch_core::Change;
use depwatch_log::{fields, Logger};
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, WatchEvent, WatchParams};
use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::error::WatchError;
use crate::handler::ChangeHandler;
use crate::project::deployment_snapshot;

/// How a watch session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The server closed the stream.
    Closed,
    /// The cancellation token fired.
    Cancelled,
}

/// Drive a raw watch stream into `handler` until it closes, fails or is cancelled.
pub async fn run_raw_watch<S, E>(
    stream: S,
    handler: &dyn ChangeHandler,
    log: &Logger,
    cancel: &CancellationToken,
) -> Result<WatchOutcome, WatchError>
where
    S: Stream<Item = Result<WatchEvent<Deployment>, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    futures::pin_mut!(stream);
    let mut seen: u64 = 0;
    let res = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(WatchOutcome::Cancelled),
            next = stream.next() => next,
        };
        let change = match next {
            None => break Ok(WatchOutcome::Closed),
            Some(Ok(WatchEvent::Added(d))) => Change::Added(deployment_snapshot(&d)),
            Some(Ok(WatchEvent::Modified(d))) => Change::Modified(deployment_snapshot(&d)),
            Some(Ok(WatchEvent::Deleted(d))) => Change::Deleted(deployment_snapshot(&d)),
            Some(Ok(WatchEvent::Bookmark(_))) => continue,
            Some(Ok(WatchEvent::Error(status))) => break Err(WatchError::Stream(Box::new(status))),
            Some(Err(e)) => break Err(WatchError::Stream(Box::new(e))),
        };
        seen += 1;
        handler.handle(&change);
    };
    match &res {
        Ok(WatchOutcome::Closed) => log.info("Watch stream closed", fields! { "events_seen" => seen }),
        Ok(WatchOutcome::Cancelled) => log.info("Watch stopped", fields! { "events_seen" => seen }),
        Err(e) => log.error("Watch stream failed", Some(e), fields! { "events_seen" => seen }),
    }
    res
}

/// Open a watch on deployments in `namespace` and run it to completion.
pub async fn watch_deployments(
    client: Client,
    namespace: &str,
    handler: &dyn ChangeHandler,
    log: &Logger,
    cancel: &CancellationToken,
) -> Result<WatchOutcome, WatchError> {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    let stream = api
        .watch(&WatchParams::default(), "0")
        .await
        .map_err(|source| WatchError::Open { namespace: namespace.to_string(), source })?;
    log.info("Watching deployments", fields! { "mode" => "watch" });
    run_raw_watch(stream, handler, log, cancel).await
}
