//! Projections from k8s-openapi objects into depwatch snapshots.

use chrono::{DateTime, Utc};
use depwatch_core::{ClusterEvent, DeploymentSnapshot, EventType};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Event;

/// Replica count the API server assumes when `spec.replicas` is unset.
const DEFAULT_REPLICAS: i32 = 1;

pub fn deployment_snapshot(d: &Deployment) -> DeploymentSnapshot {
    let status = d.status.as_ref();
    DeploymentSnapshot {
        name: d.metadata.name.clone().unwrap_or_default(),
        namespace: d.metadata.namespace.clone().unwrap_or_default(),
        desired_replicas: d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(DEFAULT_REPLICAS),
        ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        available_replicas: status.and_then(|s| s.available_replicas).unwrap_or(0),
        updated_replicas: status.and_then(|s| s.updated_replicas).unwrap_or(0),
    }
}

fn event_timestamp(e: &Event) -> Option<DateTime<Utc>> {
    e.last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| e.event_time.as_ref().map(|t| t.0))
        .or_else(|| e.first_timestamp.as_ref().map(|t| t.0))
        .or_else(|| e.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

pub fn cluster_event(e: &Event) -> ClusterEvent {
    ClusterEvent {
        event_type: EventType::parse(e.type_.as_deref().unwrap_or_default()),
        reason: e.reason.clone().unwrap_or_default(),
        message: e.message.clone().unwrap_or_default(),
        involved_object: e.involved_object.name.clone().unwrap_or_default(),
        timestamp: event_timestamp(e),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};

    #[test]
    fn deployment_defaults_missing_counts() {
        let mut d = fixtures::deployment("web", 2, 3);
        let s = deployment_snapshot(&d);
        assert_eq!((s.ready_replicas, s.desired_replicas, s.updated_replicas), (2, 3, 3));
        assert_eq!(s.namespace, "default");

        d.spec = None;
        d.status = None;
        let s = deployment_snapshot(&d);
        assert_eq!(s.desired_replicas, 1);
        assert_eq!(s.ready_replicas, 0);
        assert!(!s.is_healthy());
    }

    #[test]
    fn event_prefers_last_timestamp_then_event_time() {
        let last = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let micro = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut e = Event {
            metadata: ObjectMeta::default(),
            type_: Some("Warning".to_string()),
            reason: Some("BackOff".to_string()),
            message: Some("Back-off restarting failed container".to_string()),
            involved_object: ObjectReference { name: Some("web-5d9c".to_string()), ..Default::default() },
            last_timestamp: Some(Time(last)),
            event_time: Some(MicroTime(micro)),
            ..Default::default()
        };
        let ce = cluster_event(&e);
        assert_eq!(ce.event_type, EventType::Warning);
        assert_eq!(ce.involved_object, "web-5d9c");
        assert_eq!(ce.timestamp, Some(last));

        e.last_timestamp = None;
        assert_eq!(cluster_event(&e).timestamp, Some(micro));
        e.event_time = None;
        assert_eq!(cluster_event(&e).timestamp, None);
    }
}
