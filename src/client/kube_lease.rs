//! Kubernetes `Lease` backend for leader election.
//!
//! The leadership key is a `coordination.k8s.io/v1` Lease:
//! - `holderIdentity` is the member id (absent after a release)
//! - `leaseTransitions` is the election term
//! - `leaseDurationSeconds` / `renewTime` give the expiry
//!
//! Compare-and-swap uses `metadata.resourceVersion`: creation fails with 409
//! if the object already exists, and `replace` fails with 409 if the stored
//! version moved on. Either conflict is reported as [`CasOutcome::Conflict`].

use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

use super::standard_labels;
use crate::controller::error::{Error, Result};
use crate::election::{CasOutcome, LeaseBackend, LeaseRecord};

/// Leader lease stored as a Kubernetes Lease object.
pub struct KubeLeaseBackend {
    api: Api<Lease>,
    lease_name: String,
    cluster_name: String,
}

impl KubeLeaseBackend {
    /// Create a backend for `lease_name` in `namespace`.
    pub fn new(client: Client, namespace: &str, lease_name: &str, cluster_name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            cluster_name: cluster_name.to_string(),
        }
    }

    /// Compute the time left on a lease from its renew time and duration.
    fn remaining(spec: &LeaseSpec, now: Timestamp) -> Duration {
        if let (Some(renew_time), Some(duration)) = (&spec.renew_time, spec.lease_duration_seconds) {
            let expires_ms = renew_time.0.timestamp_millis() + i64::from(duration) * 1000;
            let left_ms = expires_ms - now.as_millisecond();
            if left_ms > 0 {
                return Duration::from_millis(left_ms as u64);
            }
        }
        // No valid spec means expired (or never acquired)
        Duration::ZERO
    }

    /// Convert a Lease object into a backend record.
    fn to_record(lease: &Lease, now: Timestamp) -> Result<LeaseRecord> {
        let revision = lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| Error::MissingField("metadata.resourceVersion".into()))?;
        let spec = lease.spec.clone().unwrap_or_default();
        Ok(LeaseRecord {
            holder_id: spec.holder_identity.clone().filter(|h| !h.is_empty()),
            term: spec.lease_transitions.unwrap_or(0).max(0) as u64,
            ttl: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
            remaining: Self::remaining(&spec, now),
            revision,
        })
    }

    /// Map API errors: server-side and transport failures mean the backend
    /// is unreachable, everything else is a plain Kubernetes error.
    fn classify(err: kube::Error) -> Error {
        let unreachable = match &err {
            kube::Error::Api(e) => e.code >= 500 || e.code == 429,
            kube::Error::Service(_) | kube::Error::HyperError(_) => true,
            _ => false,
        };
        if unreachable {
            Error::BackendUnreachable(err.to_string())
        } else {
            Error::Kube(err)
        }
    }

    fn spec_for(
        previous: Option<&LeaseSpec>,
        holder: Option<&str>,
        term: u64,
        ttl: Duration,
        now: Timestamp,
    ) -> LeaseSpec {
        let previous_holder = previous.and_then(|s| s.holder_identity.as_deref());
        let acquire_time = if holder.is_some() && holder == previous_holder {
            previous.and_then(|s| s.acquire_time.clone())
        } else if holder.is_some() {
            Some(MicroTime(to_chrono(now)))
        } else {
            None
        };
        LeaseSpec {
            holder_identity: holder.map(str::to_string),
            lease_duration_seconds: Some(i32::try_from(ttl.as_secs()).unwrap_or(i32::MAX)),
            lease_transitions: Some(i32::try_from(term).unwrap_or(i32::MAX)),
            acquire_time,
            renew_time: holder.map(|_| MicroTime(to_chrono(now))),
            ..Default::default()
        }
    }
}

#[async_trait]
impl LeaseBackend for KubeLeaseBackend {
    async fn read(&self) -> Result<Option<LeaseRecord>> {
        let lease = self.api.get_opt(&self.lease_name).await.map_err(Self::classify)?;
        lease.map(|l| Self::to_record(&l, Timestamp::now())).transpose()
    }

    async fn compare_and_swap(
        &self,
        expected: Option<&str>,
        holder: Option<&str>,
        term: u64,
        ttl: Duration,
    ) -> Result<CasOutcome> {
        let now = Timestamp::now();

        let result = match expected {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        labels: Some(standard_labels(&self.cluster_name)),
                        ..Default::default()
                    },
                    spec: Some(Self::spec_for(None, holder, term, ttl, now)),
                };
                self.api.create(&PostParams::default(), &lease).await
            }
            Some(revision) => {
                let Some(mut lease) = self.api.get_opt(&self.lease_name).await.map_err(Self::classify)? else {
                    return Ok(CasOutcome::Conflict);
                };
                if lease.metadata.resource_version.as_deref() != Some(revision) {
                    return Ok(CasOutcome::Conflict);
                }
                lease.spec = Some(Self::spec_for(lease.spec.as_ref(), holder, term, ttl, now));
                // resourceVersion stays set, so the API server rejects stale writes
                self.api
                    .replace(&self.lease_name, &PostParams::default(), &lease)
                    .await
            }
        };

        match result {
            Ok(stored) => Ok(CasOutcome::Written(Self::to_record(&stored, Timestamp::now())?)),
            Err(kube::Error::Api(e)) if e.code == 409 || e.code == 404 => {
                debug!(lease = %self.lease_name, code = e.code, "Lease write lost a race");
                Ok(CasOutcome::Conflict)
            }
            Err(e) => Err(Self::classify(e)),
        }
    }
}


/// Convert a jiff timestamp to the chrono type used by k8s-openapi.
fn to_chrono(ts: Timestamp) -> k8s_openapi::chrono::DateTime<k8s_openapi::chrono::Utc> {
    k8s_openapi::chrono::DateTime::from_timestamp(ts.as_second(), ts.subsec_nanosecond().max(0) as u32)
        .unwrap_or_default()
}
