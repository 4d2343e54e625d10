//! Cached (informer) watch: list-then-watch into a local reflector store,
//! add/update/delete dispatch with old/new pairing, periodic resync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use depwatch_core::Change;
use depwatch_log::{fields, Logger};
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::WatchError;
use crate::handler::ChangeHandler;
use crate::project::deployment_snapshot;

/// Interval at which every cached object is re-delivered as an update.
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(30);

/// Pause after a watch error once the cache is synced, before polling again.
const ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InformerState {
    Idle,
    Starting,
    Syncing,
    Synced,
    Terminated,
    SyncFailed,
}

/// Namespace-scoped deployment informer.
pub struct Informer {
    namespace: String,
    resync: Duration,
    writer: Writer<Deployment>,
    store: Store<Deployment>,
    state: watch::Sender<InformerState>,
}

impl Informer {
    pub fn new(namespace: &str, resync: Duration) -> Self {
        let writer = Writer::<Deployment>::default();
        let store = writer.as_reader();
        let (state, _) = watch::channel(InformerState::Idle);
        Self { namespace: namespace.to_string(), resync, writer, store, state }
    }

    /// Read handle on the local cache.
    pub fn store(&self) -> Store<Deployment> {
        self.store.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InformerState> {
        self.state.subscribe()
    }

    fn set_state(&self, s: InformerState) {
        self.state.send_replace(s);
    }

    /// Translate a watcher event into changes against the current cache, then apply it.
    fn dispatch(&mut self, event: &Event<Deployment>) -> Vec<Change> {
        let changes = match event {
            Event::Applied(obj) => {
                let new = deployment_snapshot(obj);
                match self.store.get(&ObjectRef::from_obj(obj)) {
                    Some(old) => vec![Change::Updated { old: deployment_snapshot(&old), new }],
                    None => vec![Change::Added(new)],
                }
            }
            Event::Deleted(obj) => vec![Change::Deleted(deployment_snapshot(obj))],
            Event::Restarted(objs) => {
                let mut before: HashMap<ObjectRef<Deployment>, Arc<Deployment>> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|o| (ObjectRef::from_obj(o.as_ref()), o))
                    .collect();
                let mut out = Vec::with_capacity(objs.len());
                for obj in objs {
                    let new = deployment_snapshot(obj);
                    match before.remove(&ObjectRef::from_obj(obj)) {
                        Some(old) => out.push(Change::Updated { old: deployment_snapshot(&old), new }),
                        None => out.push(Change::Added(new)),
                    }
                }
                // objects that vanished while we were disconnected
                let mut gone: Vec<_> = before.into_values().map(|o| deployment_snapshot(&o)).collect();
                gone.sort_by(|a, b| a.name.cmp(&b.name));
                out.extend(gone.into_iter().map(Change::Deleted));
                out
            }
        };
        self.writer.apply_watcher_event(event);
        changes
    }

    fn redeliver(&self, handler: &dyn ChangeHandler) {
        let mut cached: Vec<_> = self.store.state().iter().map(|o| deployment_snapshot(o)).collect();
        cached.sort_by(|a, b| a.name.cmp(&b.name));
        for snap in cached {
            handler.handle(&Change::Updated { old: snap.clone(), new: snap });
        }
    }

    /// Run until cancelled. Fails fast with [`WatchError::SyncFailed`] if the
    /// initial list does not complete.
    pub async fn run<S, E>(
        mut self,
        stream: S,
        handler: &dyn ChangeHandler,
        log: &Logger,
        cancel: CancellationToken,
    ) -> Result<(), WatchError>
    where
        S: Stream<Item = Result<Event<Deployment>, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        futures::pin_mut!(stream);
        self.set_state(InformerState::Starting);
        log.info("Starting informer", fields! { "resync_secs" => self.resync.as_secs() });
        self.set_state(InformerState::Syncing);
        log.info("Waiting for cache sync", fields!());

        let mut synced = false;
        let mut resync = interval_at(Instant::now() + self.resync, self.resync);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.set_state(InformerState::Terminated);
                    log.info("Informer stopped", fields! { "namespace" => self.namespace.as_str() });
                    return Ok(());
                }
                _ = resync.tick(), if synced => {
                    log.debug("Informer resync", fields! { "cached" => self.store.state().len() });
                    self.redeliver(handler);
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        let initial_list = matches!(event, Event::Restarted(_));
                        for change in self.dispatch(&event) {
                            handler.handle(&change);
                        }
                        if initial_list && !synced {
                            synced = true;
                            self.set_state(InformerState::Synced);
                            log.info("Informer cache synced successfully", fields! { "cached" => self.store.state().len() });
                        }
                    }
                    Some(Err(e)) if !synced => {
                        self.set_state(InformerState::SyncFailed);
                        log.error("Failed to sync informer", Some(&e), fields!());
                        return Err(WatchError::SyncFailed(Box::new(e)));
                    }
                    Some(Err(e)) => {
                        log.warn("Informer watch error, resuming", fields! { "error" => e.to_string() });
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(ERROR_PAUSE) => {}
                        }
                    }
                    None if !synced => {
                        self.set_state(InformerState::SyncFailed);
                        let e = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "watch stream ended before the initial list");
                        log.error("Failed to sync informer", Some(&e), fields!());
                        return Err(WatchError::SyncFailed(Box::new(e)));
                    }
                    None => {
                        self.set_state(InformerState::Terminated);
                        log.warn("Informer watch stream ended", fields!());
                        return Ok(());
                    }
                },
            }
        }
    }
}

/// Watch deployments in `namespace` through an informer until `cancel` fires.
pub async fn watch_deployments_with_informer(
    client: Client,
    namespace: &str,
    resync: Duration,
    handler: &dyn ChangeHandler,
    log: &Logger,
    cancel: CancellationToken,
) -> Result<(), WatchError> {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    let stream = watcher::watcher(api, watcher::Config::default());
    Informer::new(namespace, resync).run(stream, handler, log, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::fixtures::deployment;
    use depwatch_core::{ChangeKind, DeploymentSnapshot};
    use depwatch_log::{MemorySink, Mode};
    use futures::channel::mpsc;
    use std::sync::Mutex;

    type Item = Result<Event<Deployment>, std::io::Error>;

    struct Recorder(Mutex<Vec<Change>>);

    impl ChangeHandler for Recorder {
        fn handle(&self, change: &Change) {
            self.0.lock().unwrap().push(change.clone());
        }
    }

    impl Recorder {
        fn new() -> Self {
            Self(Mutex::new(Vec::new()))
        }
        fn take(&self) -> Vec<Change> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn log() -> Logger {
        Logger::with_sink(Mode::Development, Arc::new(MemorySink::new()))
    }

    fn snap(d: &Deployment) -> DeploymentSnapshot {
        deployment_snapshot(d)
    }

    #[tokio::test]
    async fn add_update_delete_are_paired_and_ordered() {
        let rec = Recorder::new();
        let (tx, rx) = mpsc::unbounded::<Item>();
        let informer = Informer::new("default", DEFAULT_RESYNC);
        let mut state = informer.subscribe();
        let cancel = CancellationToken::new();
        let log = log();

        let drive = async {
            tx.unbounded_send(Ok(Event::Restarted(vec![deployment("web", 0, 3)]))).unwrap();
            state.wait_for(|s| *s == InformerState::Synced).await.unwrap();
            tx.unbounded_send(Ok(Event::Applied(deployment("web", 2, 3)))).unwrap();
            tx.unbounded_send(Ok(Event::Applied(deployment("api", 1, 1)))).unwrap();
            tx.unbounded_send(Ok(Event::Deleted(deployment("web", 2, 3)))).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (res, _) = tokio::join!(informer.run(rx, &rec, &log, cancel.clone()), drive);
        res.unwrap();

        let changes = rec.take();
        assert_eq!(
            changes,
            vec![
                Change::Added(snap(&deployment("web", 0, 3))),
                Change::Updated { old: snap(&deployment("web", 0, 3)), new: snap(&deployment("web", 2, 3)) },
                Change::Added(snap(&deployment("api", 1, 1))),
                Change::Deleted(snap(&deployment("web", 2, 3))),
            ]
        );
        assert_eq!(*state.borrow(), InformerState::Terminated);
    }

    #[tokio::test]
    async fn relist_reports_vanished_objects_as_deleted() {
        let rec = Recorder::new();
        let mut informer = Informer::new("default", DEFAULT_RESYNC);
        for c in informer.dispatch(&Event::Restarted(vec![deployment("a", 1, 1), deployment("b", 1, 1)])) {
            rec.handle(&c);
        }
        rec.take();
        let changes = informer.dispatch(&Event::Restarted(vec![deployment("a", 0, 1)]));
        let kinds: Vec<_> = changes.iter().map(|c| (c.kind(), c.current().name.clone())).collect();
        assert_eq!(kinds, vec![(ChangeKind::Modified, "a".to_string()), (ChangeKind::Deleted, "b".to_string())]);
        assert_eq!(informer.store().state().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resync_redelivers_unchanged_objects() {
        let rec = Recorder::new();
        let (tx, rx) = mpsc::unbounded::<Item>();
        let informer = Informer::new("default", Duration::from_secs(30));
        let mut state = informer.subscribe();
        let cancel = CancellationToken::new();
        let log = log();

        let drive = async {
            tx.unbounded_send(Ok(Event::Restarted(vec![deployment("web", 3, 3)]))).unwrap();
            state.wait_for(|s| *s == InformerState::Synced).await.unwrap();
            tokio::time::sleep(Duration::from_secs(61)).await;
            cancel.cancel();
        };
        let (res, _) = tokio::join!(informer.run(rx, &rec, &log, cancel.clone()), drive);
        res.unwrap();

        let changes = rec.take();
        let web = snap(&deployment("web", 3, 3));
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0], Change::Added(web.clone()));
        for c in &changes[1..] {
            assert_eq!(c, &Change::Updated { old: web.clone(), new: web.clone() });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn error_after_sync_is_warned_and_watch_resumes() {
        let rec = Recorder::new();
        let (tx, rx) = mpsc::unbounded::<Item>();
        let informer = Informer::new("default", DEFAULT_RESYNC);
        let mut state = informer.subscribe();
        let cancel = CancellationToken::new();
        let sink = Arc::new(MemorySink::new());
        let log = Logger::with_sink(Mode::Development, sink.clone());

        let drive = async {
            tx.unbounded_send(Ok(Event::Restarted(vec![deployment("web", 0, 3)]))).unwrap();
            state.wait_for(|s| *s == InformerState::Synced).await.unwrap();
            tx.unbounded_send(Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))).unwrap();
            tx.unbounded_send(Ok(Event::Applied(deployment("web", 2, 3)))).unwrap();
            // relist after reconnect: web is gone, api is new
            tx.unbounded_send(Ok(Event::Restarted(vec![deployment("api", 1, 1)]))).unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
            cancel.cancel();
        };
        let (res, _) = tokio::join!(informer.run(rx, &rec, &log, cancel.clone()), drive);
        res.unwrap();

        assert_eq!(
            rec.take(),
            vec![
                Change::Added(snap(&deployment("web", 0, 3))),
                Change::Updated { old: snap(&deployment("web", 0, 3)), new: snap(&deployment("web", 2, 3)) },
                Change::Added(snap(&deployment("api", 1, 1))),
                Change::Deleted(snap(&deployment("web", 2, 3))),
            ]
        );
        let warns: Vec<_> = sink.events().into_iter().filter(|e| e.level == depwatch_log::Level::Warn).collect();
        assert_eq!(warns.len(), 1);
        assert_eq!(warns[0].message, "Informer watch error, resuming");
        assert_eq!(*state.borrow(), InformerState::Terminated);
    }

    #[tokio::test]
    async fn error_before_sync_fails_fast() {
        let rec = Recorder::new();
        let informer = Informer::new("default", DEFAULT_RESYNC);
        let state = informer.subscribe();
        let items: Vec<Item> = vec![Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "forbidden"))];
        let err = informer
            .run(futures::stream::iter(items), &rec, &log(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WatchError::SyncFailed(_)));
        assert_eq!(*state.borrow(), InformerState::SyncFailed);
        assert!(rec.take().is_empty());
    }

    #[tokio::test]
    async fn cancel_while_syncing_terminates_without_callbacks() {
        let rec = Recorder::new();
        let (tx, rx) = mpsc::unbounded::<Item>();
        let informer = Informer::new("default", DEFAULT_RESYNC);
        let mut state = informer.subscribe();
        let cancel = CancellationToken::new();
        let log = log();

        let drive = async {
            state.wait_for(|s| *s == InformerState::Syncing).await.unwrap();
            cancel.cancel();
        };
        let run = tokio::time::timeout(Duration::from_secs(5), informer.run(rx, &rec, &log, cancel.clone()));
        let (res, _) = tokio::join!(run, drive);
        res.expect("informer did not stop").unwrap();
        // nothing is dispatched once the session has ended
        let _ = tx.unbounded_send(Ok(Event::Restarted(vec![deployment("late", 1, 1)])));
        assert!(rec.take().is_empty());
        assert_eq!(*state.borrow(), InformerState::Terminated);
    }
}
