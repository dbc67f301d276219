//! Leader election over a compare-and-swap lease backend.
//!
//! The lease is the only cluster-wide mutable resource. It lives in a
//! backend (a Kubernetes `Lease` object in production) and is only ever
//! modified through [`LeaseBackend::compare_and_swap`], so every change is
//! linearized by the backend.

mod client;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::controller::error::Result;

pub use client::LeaderElection;
pub use memory::{InMemoryLeaseBackend, LeaseStore};

/// Raw lease state as stored in the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Current holder, `None` after a release.
    pub holder_id: Option<String>,
    /// Election term; incremented on every change of holder.
    pub term: u64,
    /// Lease duration.
    pub ttl: Duration,
    /// Time left before expiry, as seen when the record was read.
    pub remaining: Duration,
    /// Opaque compare-and-swap token.
    pub revision: String,
}

impl LeaseRecord {
    /// Whether the record names a holder whose lease has not run out.
    pub fn is_live(&self) -> bool {
        self.holder_id.as_deref().is_some_and(|h| !h.is_empty()) && !self.remaining.is_zero()
    }
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied; carries the stored record.
    Written(LeaseRecord),
    /// The stored revision did not match the expected one.
    Conflict,
}

/// A consensus backend offering an atomic conditional write on one key.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Read the current record, `None` if the key does not exist.
    async fn read(&self) -> Result<Option<LeaseRecord>>;

    /// Write `holder`/`term`/`ttl` only if the stored revision equals
    /// `expected`. `expected == None` means the key must not exist yet.
    /// A `None` holder clears the lease.
    async fn compare_and_swap(
        &self,
        expected: Option<&str>,
        holder: Option<&str>,
        term: u64,
        ttl: Duration,
    ) -> Result<CasOutcome>;
}

/// A member's view of the leadership lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder_id: String,
    pub term: u64,
    /// Local monotonic deadline computed at observation time.
    pub expires_at: Instant,
    pub ttl: Duration,
    /// Backend revision the lease was observed at.
    pub revision: String,
}

impl Lease {
    /// Build a lease view from a backend record observed at `observed_at`.
    /// Returns `None` when the record has no holder.
    pub fn from_record(record: &LeaseRecord, observed_at: Instant) -> Option<Self> {
        let holder = record.holder_id.as_deref().filter(|h| !h.is_empty())?;
        Some(Self {
            holder_id: holder.to_string(),
            term: record.term,
            expires_at: observed_at + record.remaining,
            ttl: record.ttl,
            revision: record.revision.clone(),
        })
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_held_by(&self, member_id: &str) -> bool {
        self.holder_id == member_id
    }

    /// Time left before expiry, zero when already expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}
