//! In-memory lease backend.
//!
//! A [`LeaseStore`] plays the role of the consensus service; each member
//! connects through its own [`InMemoryLeaseBackend`] handle, whose
//! reachability can be switched off to simulate a network partition
//! between that member and the backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{CasOutcome, LeaseBackend, LeaseRecord};
use crate::controller::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredLease {
    holder_id: Option<String>,
    term: u64,
    ttl: Duration,
    renewed_at: Instant,
    revision: u64,
}

impl StoredLease {
    fn to_record(&self, now: Instant) -> LeaseRecord {
        let expires_at = self.renewed_at + self.ttl;
        LeaseRecord {
            holder_id: self.holder_id.clone(),
            term: self.term,
            ttl: self.ttl,
            remaining: expires_at.saturating_duration_since(now),
            revision: self.revision.to_string(),
        }
    }
}

/// Shared lease storage; the single source of truth for all handles.
#[derive(Debug, Default)]
pub struct LeaseStore {
    inner: Mutex<Option<StoredLease>>,
    revision_counter: Mutex<u64>,
}

impl LeaseStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current record, bypassing any reachability switch.
    pub async fn peek(&self) -> Option<LeaseRecord> {
        self.inner.lock().await.as_ref().map(|s| s.to_record(Instant::now()))
    }
}

/// One member's connection to a [`LeaseStore`].
#[derive(Debug, Clone)]
pub struct InMemoryLeaseBackend {
    store: Arc<LeaseStore>,
    reachable: Arc<AtomicBool>,
}

impl InMemoryLeaseBackend {
    /// Connect a new handle to `store`.
    pub fn connect(store: Arc<LeaseStore>) -> Self {
        Self {
            store,
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Standalone backend with its own store.
    pub fn standalone() -> Self {
        Self::connect(LeaseStore::new())
    }

    /// Cut or restore this handle's connectivity.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<LeaseStore> {
        &self.store
    }

    fn check_reachable(&self) -> Result<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(Error::BackendUnreachable("lease store not reachable".into()))
        }
    }
}

#[async_trait]
impl LeaseBackend for InMemoryLeaseBackend {
    async fn read(&self) -> Result<Option<LeaseRecord>> {
        self.check_reachable()?;
        let now = Instant::now();
        Ok(self.store.inner.lock().await.as_ref().map(|s| s.to_record(now)))
    }

    async fn compare_and_swap(
        &self,
        expected: Option<&str>,
        holder: Option<&str>,
        term: u64,
        ttl: Duration,
    ) -> Result<CasOutcome> {
        self.check_reachable()?;
        let mut guard = self.store.inner.lock().await;
        let current = guard.as_ref().map(|s| s.revision.to_string());
        if current.as_deref() != expected {
            return Ok(CasOutcome::Conflict);
        }

        let revision = {
            let mut counter = self.store.revision_counter.lock().await;
            *counter += 1;
            *counter
        };
        let now = Instant::now();
        let stored = StoredLease {
            holder_id: holder.map(str::to_string),
            term,
            ttl,
            renewed_at: now,
            revision,
        };
        let record = stored.to_record(now);
        *guard = Some(stored);
        Ok(CasOutcome::Written(record))
    }
}
