//! depwatch core types: read-only projections of cluster state and change notifications

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace used when none is given.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Number of events returned when the caller gives no usable limit.
pub const DEFAULT_EVENT_LIMIT: u32 = 10;

/// Phase bucket for pods that report no phase at all.
pub const UNKNOWN_PHASE: &str = "Unknown";

/// A deployment is healthy iff it has at least as many ready replicas as desired.
///
/// Every rendering path (console, log fields, HTTP) goes through this predicate.
pub fn is_healthy(ready: i32, desired: i32) -> bool {
    ready >= desired
}

/// Resolve a raw `limit` value into a usable event limit.
///
/// Anything that is not a positive integer falls back to [`DEFAULT_EVENT_LIMIT`].
pub fn parse_event_limit(raw: Option<&str>) -> u32 {
    raw.map(str::trim)
        .and_then(|s| s.parse::<i64>().ok())
        .map(clamp_event_limit)
        .unwrap_or(DEFAULT_EVENT_LIMIT)
}

/// Numeric form of [`parse_event_limit`].
pub fn clamp_event_limit(limit: i64) -> u32 {
    if limit <= 0 {
        return DEFAULT_EVENT_LIMIT;
    }
    u32::try_from(limit).unwrap_or(u32::MAX)
}

/// Projection of a Deployment at observation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSnapshot {
    pub name: String,
    pub namespace: String,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    pub updated_replicas: i32,
}

impl DeploymentSnapshot {
    pub fn is_healthy(&self) -> bool {
        is_healthy(self.ready_replicas, self.desired_replicas)
    }

    /// `ready/desired`, the way the console renders replica counts.
    pub fn replica_ratio(&self) -> String {
        format!("{}/{}", self.ready_replicas, self.desired_replicas)
    }
}

/// Kubernetes event type. Anything other than Normal/Warning is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Normal,
    Warning,
    Other(String),
}

impl EventType {
    pub fn parse(s: &str) -> Self {
        match s {
            "Normal" => Self::Normal,
            "Warning" => Self::Warning,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// A cluster event as returned by the API, in API order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub involved_object: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Change notification delivered by either watch strategy.
///
/// The raw watch only knows the current state of a modified object
/// (`Modified`); the informer always pairs old and new (`Updated`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added(DeploymentSnapshot),
    Modified(DeploymentSnapshot),
    Updated { old: DeploymentSnapshot, new: DeploymentSnapshot },
    Deleted(DeploymentSnapshot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// Upper-case label used on the console and in `event_type` log fields.
    pub fn label(self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
        }
    }
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Added(_) => ChangeKind::Added,
            Self::Modified(_) | Self::Updated { .. } => ChangeKind::Modified,
            Self::Deleted(_) => ChangeKind::Deleted,
        }
    }

    /// Current (or last known, for deletions) state of the object.
    pub fn current(&self) -> &DeploymentSnapshot {
        match self {
            Self::Added(s) | Self::Modified(s) | Self::Deleted(s) => s,
            Self::Updated { new, .. } => new,
        }
    }
}

/// Aggregate of a namespace: deployment health, pod phase histogram, service count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub namespace: String,
    pub deployments_total: usize,
    pub deployments_healthy: usize,
    pub deployments_unhealthy: usize,
    pub pods_total: usize,
    pub pod_phases: BTreeMap<String, u32>,
    pub services_total: usize,
}

impl StatusSummary {
    pub fn tally<'a, P>(namespace: &str, deployments: &[DeploymentSnapshot], pod_phases: P, services_total: usize) -> Self
    where
        P: IntoIterator<Item = Option<&'a str>>,
    {
        let healthy = deployments.iter().filter(|d| d.is_healthy()).count();
        let mut phases: BTreeMap<String, u32> = BTreeMap::new();
        let mut pods_total = 0;
        for phase in pod_phases {
            pods_total += 1;
            *phases.entry(phase.unwrap_or(UNKNOWN_PHASE).to_string()).or_default() += 1;
        }
        Self {
            namespace: namespace.to_string(),
            deployments_total: deployments.len(),
            deployments_healthy: healthy,
            deployments_unhealthy: deployments.len() - healthy,
            pods_total,
            pod_phases: phases,
            services_total,
        }
    }
}
