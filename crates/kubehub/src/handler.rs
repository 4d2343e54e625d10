use std::io::{self, Write};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use depwatch_core::Change;
use depwatch_log::{fields, Logger};

/// Receives change notifications from a watch session, one at a time and in
/// the order the session observed them.
///
/// Informer resyncs re-deliver `Updated` with `old == new`; implementations
/// must tolerate repeats.
pub trait ChangeHandler: Send + Sync {
    fn handle(&self, change: &Change);
}

impl<F> ChangeHandler for F
where
    F: Fn(&Change) + Send + Sync,
{
    fn handle(&self, change: &Change) {
        self(change)
    }
}

/// Console line for a change, e.g. `[14:05:09] MODIFIED: web (0/3 -> 2/3 replicas)`.
pub fn render_change(change: &Change, at: DateTime<Utc>) -> String {
    let ts = at.format("%H:%M:%S");
    let label = change.kind().label();
    match change {
        Change::Added(d) | Change::Modified(d) => {
            format!("[{ts}] {label}: {} ({} replicas)", d.name, d.replica_ratio())
        }
        Change::Updated { old, new } => {
            format!("[{ts}] {label}: {} ({} -> {} replicas)", new.name, old.replica_ratio(), new.replica_ratio())
        }
        Change::Deleted(d) => format!("[{ts}] {label}: {}", d.name),
    }
}

/// Logs each change with deployment context and prints its console line to
/// `out` (stdout unless built with [`ConsoleHandler::with_writer`]).
pub struct ConsoleHandler<W = io::Stdout> {
    log: Logger,
    out: Mutex<W>,
}

impl ConsoleHandler {
    pub fn new(log: Logger) -> Self {
        Self::with_writer(log, io::stdout())
    }
}

impl<W: Write + Send> ConsoleHandler<W> {
    pub fn with_writer(log: Logger, out: W) -> Self {
        Self { log, out: Mutex::new(out) }
    }

    pub fn into_writer(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn print(&self, line: &str) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
            self.log.warn("Failed to write change line", fields! { "error" => e.to_string() });
        }
    }

    fn log_change(&self, change: &Change) {
        let current = change.current();
        let log = self.log.with_deployment(&current.name);
        let event_type = change.kind().label();
        match change {
            Change::Added(d) => log.info(
                "Deployment added",
                fields! { "event_type" => event_type, "ready_replicas" => d.ready_replicas, "desired_replicas" => d.desired_replicas },
            ),
            Change::Modified(d) => log.info(
                "Deployment modified",
                fields! { "event_type" => event_type, "ready_replicas" => d.ready_replicas, "desired_replicas" => d.desired_replicas },
            ),
            Change::Updated { old, new } => log.info(
                "Deployment updated",
                fields! {
                    "event_type" => event_type,
                    "old_ready_replicas" => old.ready_replicas,
                    "new_ready_replicas" => new.ready_replicas,
                    "old_desired_replicas" => old.desired_replicas,
                    "new_desired_replicas" => new.desired_replicas,
                },
            ),
            Change::Deleted(_) => log.info("Deployment deleted", fields! { "event_type" => event_type }),
        }
    }
}

impl<W: Write + Send> ChangeHandler for ConsoleHandler<W> {
    fn handle(&self, change: &Change) {
        metrics::counter!("depwatch_changes_total", 1u64, "kind" => change.kind().label());
        self.log_change(change);
        self.print(&render_change(change, Utc::now()));
    }
}
