//! Leader election over a `coordination.k8s.io/v1` Lease.
//!
//! One manager replica holds the lease and runs the reconciler; the others
//! block in [`LeaderElection::acquire`] until the holder stops renewing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::core::ErrorResponse;
use kube::Client;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Consecutive renewal failures tolerated before leadership is given up.
pub const MAX_RENEWAL_FAILURES: u32 = 3;

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeaseConfigError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("renew interval ({renew:?}) must be less than lease duration ({duration:?})")]
    RenewTooSlow { renew: Duration, duration: Duration },
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease request failed: {0}")]
    Api(#[from] kube::Error),
    #[error("leadership lost to {holder}")]
    Lost { holder: String },
    #[error("failed to renew lease after {attempts} consecutive attempts: {source}")]
    RenewalFailed {
        attempts: u32,
        #[source]
        source: kube::Error,
    },
}

/// Validated leader election settings. Construct with [`LeaseConfig::new`].
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    lease_name: String,
    namespace: String,
    holder_id: String,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl LeaseConfig {
    pub fn new(
        lease_name: impl Into<String>,
        namespace: impl Into<String>,
        holder_id: impl Into<String>,
        lease_duration: Duration,
        renew_interval: Duration,
    ) -> Result<Self, LeaseConfigError> {
        let (lease_name, namespace, holder_id) = (lease_name.into(), namespace.into(), holder_id.into());
        if lease_name.is_empty() {
            return Err(LeaseConfigError::Empty("lease name"));
        }
        if namespace.is_empty() {
            return Err(LeaseConfigError::Empty("lease namespace"));
        }
        if holder_id.is_empty() {
            return Err(LeaseConfigError::Empty("holder id"));
        }
        if renew_interval >= lease_duration {
            return Err(LeaseConfigError::RenewTooSlow { renew: renew_interval, duration: lease_duration });
        }
        Ok(Self { lease_name, namespace, holder_id, lease_duration, renew_interval })
    }

    pub fn lease_name(&self) -> &str {
        &self.lease_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }
}

/// `POD_NAME` when running in a pod, otherwise a random `depwatch-<uuid>`.
pub fn default_holder_id() -> String {
    std::env::var("POD_NAME")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| format!("depwatch-{}", uuid::Uuid::new_v4()))
}

/// True when nobody holds the lease or the holder stopped renewing it.
pub fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    if spec.holder_identity.as_deref().map_or(true, str::is_empty) {
        return true;
    }
    let Some(MicroTime(last)) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else {
        return true;
    };
    let ttl = spec
        .lease_duration_seconds
        .map(|s| chrono::Duration::seconds(i64::from(s)))
        .unwrap_or_else(|| chrono::Duration::seconds(DEFAULT_LEASE_DURATION.as_secs() as i64));
    *last + ttl < now
}

pub fn is_held_by(spec: &LeaseSpec, holder: &str) -> bool {
    spec.holder_identity.as_deref() == Some(holder)
}

fn holder_of(lease: &Lease) -> String {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ErrorResponse { code: 409, .. }))
}

/// Result of one acquire-or-renew round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseStatus {
    pub acquired: bool,
    pub holder: String,
}

pub struct LeaderElection {
    api: Api<Lease>,
    config: LeaseConfig,
}

impl LeaderElection {
    pub fn new(client: Client, config: LeaseConfig) -> Self {
        let api = Api::namespaced(client, config.namespace());
        Self { api, config }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    fn claim(&self, spec: &mut LeaseSpec, now: DateTime<Utc>, transition: bool) {
        spec.holder_identity = Some(self.config.holder_id.clone());
        spec.lease_duration_seconds = Some(self.config.lease_duration.as_secs() as i32);
        spec.acquire_time = Some(MicroTime(now));
        spec.renew_time = Some(MicroTime(now));
        if transition {
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
    }

    /// Create the lease, renew it if we hold it, or take it over if it expired.
    ///
    /// Losing a write race to another replica is reported as not acquired.
    pub async fn try_acquire_or_renew(&self) -> Result<LeaseStatus, LeaseError> {
        let name = self.config.lease_name.as_str();
        let now = Utc::now();
        let me = self.config.holder_id.clone();

        let Some(mut lease) = self.api.get_opt(name).await? else {
            let mut spec = LeaseSpec { lease_transitions: Some(0), ..Default::default() };
            self.claim(&mut spec, now, false);
            let lease = Lease {
                metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
                spec: Some(spec),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(LeaseStatus { acquired: true, holder: me }),
                Err(e) if is_conflict(&e) => Ok(LeaseStatus { acquired: false, holder: "unknown".into() }),
                Err(e) => Err(e.into()),
            };
        };

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        if is_held_by(spec, &me) {
            spec.renew_time = Some(MicroTime(now));
        } else if lease_expired(spec, now) {
            debug!(previous = ?spec.holder_identity, "Lease expired, taking over");
            self.claim(spec, now, true);
        } else {
            return Ok(LeaseStatus { acquired: false, holder: holder_of(&lease) });
        }

        // resourceVersion from the read makes this a compare-and-swap
        match self.api.replace(name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(LeaseStatus { acquired: true, holder: me }),
            Err(e) if is_conflict(&e) => {
                let holder = self.api.get_opt(name).await?.map(|l| holder_of(&l)).unwrap_or_default();
                Ok(LeaseStatus { acquired: false, holder })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Block until leadership is acquired. Returns `false` if cancelled first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        info!(lease = %self.config.lease_name, holder = %self.config.holder_id, "Attempting to acquire leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(s) if s.acquired => {
                    info!(holder = %s.holder, "Leadership acquired");
                    return true;
                }
                Ok(s) => info!(current_holder = %s.holder, "Another replica is leader, waiting"),
                Err(e) => warn!(error = %e, "Failed to check leadership, retrying"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.renew_interval) => {}
            }
        }
    }

    /// Renew the lease every renew interval until `cancel` fires.
    ///
    /// Resolves with an error when another replica takes the lease or after
    /// [`MAX_RENEWAL_FAILURES`] consecutive failed renewals. On cancellation
    /// the lease is released.
    pub fn spawn_renewal(self, cancel: CancellationToken) -> JoinHandle<Result<(), LeaseError>> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.renew_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut failures: u32 = 0;
            info!(
                interval_secs = self.config.renew_interval.as_secs(),
                max_failures = MAX_RENEWAL_FAILURES,
                "Starting lease renewal loop"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.release().await;
                        return Ok(());
                    }
                    _ = interval.tick() => {}
                }
                match self.try_acquire_or_renew().await {
                    Ok(s) if s.acquired => {
                        if failures > 0 {
                            info!(previous_failures = failures, "Lease renewed after transient failures");
                        }
                        failures = 0;
                        trace!("Lease renewed");
                    }
                    Ok(s) => {
                        error!(new_holder = %s.holder, "Lost leadership to another replica");
                        return Err(LeaseError::Lost { holder: s.holder });
                    }
                    Err(LeaseError::Api(e)) => {
                        failures += 1;
                        if failures >= MAX_RENEWAL_FAILURES {
                            error!(error = %e, consecutive_failures = failures, "Giving up leadership");
                            return Err(LeaseError::RenewalFailed { attempts: failures, source: e });
                        }
                        warn!(error = %e, attempt = failures, max_attempts = MAX_RENEWAL_FAILURES, "Transient lease renewal failure, will retry");
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    /// Clear the holder so a standby can take over without waiting for expiry.
    pub async fn release(&self) {
        let name = self.config.lease_name.as_str();
        let mut lease = match self.api.get_opt(name).await {
            Ok(Some(l)) => l,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read lease for release");
                return;
            }
        };
        let Some(spec) = lease.spec.as_mut().filter(|s| is_held_by(s, &self.config.holder_id)) else {
            return;
        };
        spec.holder_identity = None;
        spec.acquire_time = None;
        spec.renew_time = None;
        match self.api.replace(name, &PostParams::default(), &lease).await {
            Ok(_) => info!(lease = %name, "Leadership released"),
            Err(e) => warn!(error = %e, "Failed to release lease"),
        }
    }
}
