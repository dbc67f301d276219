//! Leader election client.
//!
//! Wraps a [`LeaseBackend`] with the acquire/renew/release/observe contract.
//! Every backend call carries a deadline; running past it is reported as
//! `BackendUnreachable` so the caller can degrade to an unknown role
//! instead of blocking.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CasOutcome, Lease, LeaseBackend, LeaseRecord};
use crate::controller::error::{Error, Result};

/// Client for the leadership lease.
#[derive(Clone)]
pub struct LeaderElection {
    backend: Arc<dyn LeaseBackend>,
    call_timeout: Duration,
}

impl LeaderElection {
    /// Create a client whose backend calls are bounded by `call_timeout`.
    pub fn new(backend: Arc<dyn LeaseBackend>, call_timeout: Duration) -> Self {
        Self {
            backend,
            call_timeout,
        }
    }

    /// Change the per-call deadline (follows `retry_timeout` updates).
    pub fn set_call_timeout(&mut self, call_timeout: Duration) {
        self.call_timeout = call_timeout;
    }

    async fn bounded<T>(&self, op: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation = op, timeout = ?self.call_timeout, "Lease backend call exceeded deadline");
                Err(Error::BackendUnreachable(format!(
                    "{} exceeded deadline of {:?}",
                    op, self.call_timeout
                )))
            }
        }
    }

    async fn read(&self) -> Result<(Option<LeaseRecord>, Instant)> {
        let record = self.bounded("read", self.backend.read()).await?;
        Ok((record, Instant::now()))
    }

    async fn write(
        &self,
        expected: Option<&str>,
        holder: Option<&str>,
        term: u64,
        ttl: Duration,
    ) -> Result<CasOutcome> {
        self.bounded(
            "compare_and_swap",
            self.backend.compare_and_swap(expected, holder, term, ttl),
        )
        .await
    }

    /// Try to become the lease holder.
    ///
    /// Succeeds when the lease is absent, expired, or already ours. A lost
    /// compare-and-swap race is reported as `LeaseHeld` with the winner.
    pub async fn acquire(&self, member_id: &str, ttl: Duration) -> Result<Lease> {
        let (current, observed_at) = self.read().await?;

        let (expected, next_term) = match &current {
            Some(record) if record.is_live() => {
                let holder = record.holder_id.clone().unwrap_or_default();
                if holder != member_id {
                    return Err(Error::LeaseHeld {
                        holder,
                        term: record.term,
                    });
                }
                debug!(member = %member_id, term = record.term, "Already holding lease, renewing");
                (Some(record.revision.as_str()), record.term)
            }
            Some(record) => (Some(record.revision.as_str()), record.term + 1),
            None => (None, 1),
        };

        match self.write(expected, Some(member_id), next_term, ttl).await? {
            CasOutcome::Written(record) => {
                let lease = Lease::from_record(&record, Instant::now())
                    .ok_or_else(|| Error::MissingField("lease holder".into()))?;
                info!(member = %member_id, term = lease.term, "Acquired leader lease");
                Ok(lease)
            }
            CasOutcome::Conflict => {
                // Someone else won the race; report who.
                let (winner, _) = self.read().await?;
                let (holder, term) = winner
                    .and_then(|r| r.holder_id.clone().map(|h| (h, r.term)))
                    .unwrap_or_else(|| ("unknown".to_string(), next_term));
                debug!(
                    member = %member_id,
                    winner = %holder,
                    observed_at = ?observed_at,
                    "Lost lease acquisition race"
                );
                Err(Error::LeaseHeld { holder, term })
            }
        }
    }

    /// Extend a lease we hold.
    ///
    /// Fails with `LeaseExpired` if the lease ran out, changed hands, or
    /// was modified concurrently.
    pub async fn renew(&self, lease: &Lease) -> Result<Lease> {
        if lease.is_expired() {
            return Err(Error::LeaseExpired(format!(
                "local deadline for term {} passed",
                lease.term
            )));
        }
        let (current, _) = self.read().await?;
        let record = match current {
            Some(record)
                if record.is_live()
                    && record.holder_id.as_deref() == Some(lease.holder_id.as_str())
                    && record.term == lease.term =>
            {
                record
            }
            Some(record) => {
                return Err(Error::LeaseExpired(format!(
                    "lease now held by {:?} at term {}",
                    record.holder_id, record.term
                )));
            }
            None => return Err(Error::LeaseExpired("lease no longer exists".into())),
        };

        match self
            .write(Some(&record.revision), Some(&lease.holder_id), lease.term, lease.ttl)
            .await?
        {
            CasOutcome::Written(record) => Lease::from_record(&record, Instant::now())
                .ok_or_else(|| Error::MissingField("lease holder".into())),
            CasOutcome::Conflict => Err(Error::LeaseExpired(
                "lease modified concurrently during renew".into(),
            )),
        }
    }

    /// Give up a lease. Releasing a lease we no longer hold is a no-op.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        let (current, _) = self.read().await?;
        let Some(record) = current else {
            return Ok(());
        };
        if record.holder_id.as_deref() != Some(lease.holder_id.as_str()) || record.term != lease.term {
            debug!(
                member = %lease.holder_id,
                term = lease.term,
                "Lease already moved on, nothing to release"
            );
            return Ok(());
        }
        match self
            .write(Some(&record.revision), None, record.term, record.ttl)
            .await?
        {
            CasOutcome::Written(_) => {
                info!(member = %lease.holder_id, term = lease.term, "Released leader lease");
                Ok(())
            }
            // Whoever changed it now owns the outcome.
            CasOutcome::Conflict => Ok(()),
        }
    }

    /// Current lease snapshot, including an expired one. `None` when there
    /// is no holder.
    pub async fn observe(&self) -> Result<Option<Lease>> {
        let (record, observed_at) = self.read().await?;
        Ok(record.and_then(|r| Lease::from_record(&r, observed_at)))
    }
}
