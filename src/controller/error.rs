//! Error types for the supervisor.
//!
//! Defines the crate-wide error taxonomy with classification for retry
//! behavior. Lease outcomes (`LeaseHeld`, `LeaseExpired`) are expected
//! control-flow signals; `DataGap` and `ForeignStorage` are fatal and must
//! reach an operator.

use std::time::Duration;
use thiserror::Error;

/// Error type for supervisor operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The consensus backend could not be reached or the call deadline passed
    #[error("Consensus backend unreachable: {0}")]
    BackendUnreachable(String),

    /// Another member holds a non-expired lease
    #[error("Lease held by {holder} (term {term})")]
    LeaseHeld { holder: String, term: u64 },

    /// Our lease expired or was taken over before renewal
    #[error("Lease expired: {0}")]
    LeaseExpired(String),

    /// Required WAL segments were already discarded
    #[error(
        "WAL data gap: segments from {required_from} are required but the oldest retained is {oldest_retained:?}"
    )]
    DataGap {
        required_from: u64,
        oldest_retained: Option<u64>,
    },

    /// Retention floor may only move forward
    #[error("Retention floor cannot move backwards: requested {requested}, current {current}")]
    RetentionRegression { requested: u64, current: u64 },

    /// Data on a volume or in the data directory belongs to another cluster
    #[error("Foreign storage: {0}")]
    ForeignStorage(String),

    /// Volume is still mounted by a running pod
    #[error("Volume {0} is still mounted")]
    StillMounted(String),

    /// Another claim already references the target volume
    #[error("Claim name conflict: {0}")]
    NameConflict(String),

    /// A candidate did not finish its election in time
    #[error("Detection timeout: {0}")]
    DetectionTimeout(String),

    /// Member is not present in the registry
    #[error("Unknown member: {0}")]
    UnknownMember(String),

    /// Missing required field in a resource or configuration
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in configuration or input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database administrative command failed
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Workload action (promote/demote/restart/clone) failed
    #[error("Workload action failed: {0}")]
    Workload(String),

    /// Peer request failed
    #[error("Peer request failed: {0}")]
    Peer(String),

    /// Operation was cancelled by a shutdown signal
    #[error("Operation cancelled by shutdown")]
    Cancelled,

    /// Bounded retry ran out of time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error indicates an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::BackendUnreachable(_)
            | Error::StillMounted(_)
            | Error::NameConflict(_)
            | Error::Peer(_)
            | Error::Timeout(_)
            | Error::Io(_) => true,
            Error::Database(_) | Error::Workload(_) => true,
            Error::LeaseHeld { .. } | Error::LeaseExpired(_) | Error::DetectionTimeout(_) => false,
            Error::DataGap { .. } | Error::RetentionRegression { .. } | Error::ForeignStorage(_) => false,
            Error::UnknownMember(_)
            | Error::MissingField(_)
            | Error::Validation(_)
            | Error::Cancelled
            | Error::Serialization(_) => false,
        }
    }

    /// Transport-level failures worth repeating the same call for.
    ///
    /// Narrower than `is_retryable`: conflicts such as `NameConflict` need a
    /// corrective action first, not the same request again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::BackendUnreachable(_) | Error::Peer(_) | Error::Timeout(_) | Error::Io(_) => true,
            Error::Kube(_) => self.is_retryable(),
            _ => false,
        }
    }

    /// Errors that must halt automatic promotion until an operator acts
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::DataGap { .. } | Error::ForeignStorage(_))
    }

    /// Get the recommended retry delay for this error
    pub fn retry_after(&self) -> Duration {
        match self {
            Error::BackendUnreachable(_) | Error::Peer(_) => Duration::from_secs(1),
            Error::StillMounted(_) | Error::NameConflict(_) => Duration::from_secs(5),
            _ if self.is_retryable() => Duration::from_secs(10),
            _ => Duration::from_secs(3600),
        }
    }
}

/// Result type alias for supervisor operations
pub type Result<T> = std::result::Result<T, Error>;
