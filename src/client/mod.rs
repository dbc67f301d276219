//! Clients for the supervisor's external collaborators.
//!
//! ## Architecture
//!
//! - `kube_lease`: leader lease stored as a Kubernetes `Lease`
//! - `kube_storage`: volumes, claims and the StatefulSet via the Kubernetes API
//! - `peer`: HTTP heartbeats and WAL segment fetches between members
//! - `postgres`: administrative commands and workload actions for the local database

use std::collections::BTreeMap;

pub mod kube_lease;
pub mod kube_storage;
pub mod peer;
pub mod postgres;

pub use kube_lease::KubeLeaseBackend;
pub use kube_storage::{KubeOrchestrator, KubeStorageApi};
pub use peer::{HttpPeerTransport, PeerTransport};
pub use postgres::{AdminChannel, CommandWorkload, PostgresAdmin, Workload};

/// Field manager name for server-side apply
pub const FIELD_MANAGER: &str = "pg-ha-supervisor";

/// Standard labels applied to objects the supervisor creates
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), "postgresql".to_string());
    labels.insert("app.kubernetes.io/instance".to_string(), cluster_name.to_string());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );
    labels
}
