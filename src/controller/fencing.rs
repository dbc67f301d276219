//! Write gate.
//!
//! The gate is the single switch deciding whether this member may accept
//! writes. It is opened only after a successful promotion, carries the
//! local lease deadline, and is closed before any role is given up. Past
//! the deadline it reads as closed even if the control loop never runs
//! again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::time::Instant;
use tracing::warn;

#[derive(Debug)]
struct GateInner {
    open: AtomicBool,
    /// Lease term the gate was opened for.
    term: AtomicU64,
    /// Reference point for `deadline_nanos`.
    base: Instant,
    /// Lease deadline, in nanoseconds after `base`.
    deadline_nanos: AtomicU64,
}

/// Shared write gate; clones refer to the same gate.
#[derive(Debug, Clone)]
pub struct WriteGate {
    inner: Arc<GateInner>,
}

impl Default for WriteGate {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                open: AtomicBool::new(false),
                term: AtomicU64::new(0),
                base: Instant::now(),
                deadline_nanos: AtomicU64::new(0),
            }),
        }
    }

    fn offset(&self, at: Instant) -> u64 {
        u64::try_from(at.saturating_duration_since(self.inner.base).as_nanos()).unwrap_or(u64::MAX)
    }

    /// Allow writes under lease `term` until `deadline`.
    pub fn open(&self, term: u64, deadline: Instant) {
        self.inner.term.store(term, Ordering::SeqCst);
        self.inner
            .deadline_nanos
            .store(self.offset(deadline), Ordering::SeqCst);
        self.inner.open.store(true, Ordering::SeqCst);
    }

    /// Move the deadline after a successful renew.
    pub fn extend(&self, deadline: Instant) {
        self.inner
            .deadline_nanos
            .store(self.offset(deadline), Ordering::SeqCst);
    }

    /// Stop accepting writes. Returns whether the gate was open.
    pub fn close(&self, reason: &str) -> bool {
        let was_open = self.inner.open.swap(false, Ordering::SeqCst);
        if was_open {
            warn!(reason, term = self.term(), "Write gate closed");
        }
        was_open
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
            && self.offset(Instant::now()) < self.inner.deadline_nanos.load(Ordering::SeqCst)
    }

    pub fn term(&self) -> u64 {
        self.inner.term.load(Ordering::SeqCst)
    }
}
