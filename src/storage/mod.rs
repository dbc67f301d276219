//! Persistent volume reuse across scale-to-zero.
//!
//! The coordinator works on an immutable [`StorageSnapshot`] taken once at
//! the start of a reattachment and talks to the platform only through the
//! [`StorageApi`] and [`Orchestrator`] traits.

pub mod coordinator;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::controller::error::{Error, Result};

pub use coordinator::{ReattachState, ReattachmentCoordinator, TransitionRecord};
pub use memory::InMemoryStorage;

/// Annotations the binder controller sets on a bound claim.
pub const BINDING_ANNOTATIONS: [&str; 2] = [
    "pv.kubernetes.io/bind-completed",
    "pv.kubernetes.io/bound-by-controller",
];

/// Claim label naming the cluster whose data the claimed volume holds.
pub const CLUSTER_LABEL: &str = "app.kubernetes.io/instance";

/// What the platform does with a volume once its claim is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    Retain,
    Delete,
    Recycle,
}

impl ReclaimPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReclaimPolicy::Retain => "Retain",
            ReclaimPolicy::Delete => "Delete",
            ReclaimPolicy::Recycle => "Recycle",
        }
    }

    /// Parse the Kubernetes string form.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "Retain" => Ok(ReclaimPolicy::Retain),
            "Delete" => Ok(ReclaimPolicy::Delete),
            "Recycle" => Ok(ReclaimPolicy::Recycle),
            other => Err(Error::Validation(format!("unknown reclaim policy '{}'", other))),
        }
    }
}

impl fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A volume's back-reference to the claim bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReference {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
}

/// Point-in-time view of a persistent volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub name: String,
    pub uid: Option<String>,
    pub reclaim_policy: ReclaimPolicy,
    pub claim_ref: Option<ClaimReference>,
    pub host_path: Option<String>,
}

/// Point-in-time view of a persistent volume claim.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub volume_name: Option<String>,
    pub storage_class: Option<String>,
    pub access_modes: Vec<String>,
    /// Requested capacity as a Kubernetes quantity string.
    pub storage_request: Option<String>,
}

impl ClaimRecord {
    /// Claim with this claim's identity pointing at `volume_name`.
    ///
    /// Server-assigned and binding fields are stripped so the result can be
    /// applied as a fresh object, repeatedly.
    pub fn for_rebind(&self, volume_name: &str) -> Self {
        let mut annotations = self.annotations.clone();
        for key in BINDING_ANNOTATIONS {
            annotations.remove(key);
        }
        Self {
            uid: None,
            resource_version: None,
            annotations,
            volume_name: Some(volume_name.to_string()),
            ..self.clone()
        }
    }

    pub fn same_identity(&self, other: &ClaimRecord) -> bool {
        self.name == other.name && self.namespace == other.namespace
    }

    /// Whether two claims describe the same desired object.
    pub fn same_target(&self, other: &ClaimRecord) -> bool {
        self.same_identity(other) && self.volume_name == other.volume_name
    }
}

/// Binding between a volume and the member whose data it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub volume_id: String,
    pub claim_id: String,
    pub bound_member_id: Option<String>,
    pub reclaim_policy: ReclaimPolicy,
}

/// Immutable inputs of one reattachment, captured before any change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSnapshot {
    /// Volume whose data is reused.
    pub volume: VolumeRecord,
    /// Claim currently bound to that volume; deleted during detach.
    pub source_claim: Option<ClaimRecord>,
    /// Claim whose identity the rebound claim takes over.
    pub target_claim: ClaimRecord,
    /// Member that last ran on the volume (the last primary).
    pub member_id: Option<String>,
    /// Cluster whose data the volume holds, from its current claim.
    pub source_cluster: Option<String>,
    /// Cluster the target claim belongs to.
    pub target_cluster: Option<String>,
    pub taken_at: Timestamp,
}

impl StorageSnapshot {
    /// Capture a snapshot from the storage API.
    pub async fn capture(
        api: &dyn StorageApi,
        volume_name: &str,
        target_namespace: &str,
        target_claim: &str,
        member_id: Option<String>,
    ) -> Result<Self> {
        let volume = api
            .get_volume(volume_name)
            .await?
            .ok_or_else(|| Error::MissingField(format!("persistent volume {}", volume_name)))?;
        let source_claim = match &volume.claim_ref {
            Some(r) => api.get_claim(&r.namespace, &r.name).await?,
            None => None,
        };
        let target_claim = api
            .get_claim(target_namespace, target_claim)
            .await?
            .ok_or_else(|| {
                Error::MissingField(format!("claim {}/{}", target_namespace, target_claim))
            })?;
        let cluster_of = |claim: &ClaimRecord| claim.labels.get(CLUSTER_LABEL).cloned();
        Ok(Self {
            source_cluster: source_claim.as_ref().and_then(cluster_of),
            target_cluster: cluster_of(&target_claim),
            volume,
            source_claim,
            target_claim,
            member_id,
            taken_at: Timestamp::now(),
        })
    }

    /// Fails with `ForeignStorage` when the volume's data is labelled with
    /// another cluster than the target claim. Unlabelled claims pass.
    pub fn check_same_cluster(&self) -> Result<()> {
        match (&self.source_cluster, &self.target_cluster) {
            (Some(source), Some(target)) if source != target => Err(Error::ForeignStorage(format!(
                "volume {} holds data of cluster {}, not {}",
                self.volume.name, source, target
            ))),
            _ => Ok(()),
        }
    }

    /// The binding as it was when the snapshot was taken.
    pub fn binding(&self) -> VolumeBinding {
        VolumeBinding {
            volume_id: self.volume.name.clone(),
            claim_id: self
                .volume
                .claim_ref
                .as_ref()
                .map(|r| format!("{}/{}", r.namespace, r.name))
                .unwrap_or_default(),
            bound_member_id: self.member_id.clone(),
            reclaim_policy: self.volume.reclaim_policy,
        }
    }

    /// The claim that will be applied by the rebind step.
    pub fn desired_claim(&self) -> ClaimRecord {
        self.target_claim.for_rebind(&self.volume.name)
    }
}

/// Volume and claim operations of the storage platform.
#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn get_volume(&self, name: &str) -> Result<Option<VolumeRecord>>;

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimRecord>>;

    async fn set_reclaim_policy(&self, volume: &str, policy: ReclaimPolicy) -> Result<()>;

    /// Remove the volume's claim reference so it becomes `Available`.
    async fn clear_claim_ref(&self, volume: &str) -> Result<()>;

    /// Delete a claim. Deleting a missing claim succeeds.
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;

    /// Create or update a claim to match `claim`.
    async fn apply_claim(&self, claim: &ClaimRecord) -> Result<ClaimRecord>;

    /// Whether a running pod mounts the claim.
    async fn is_mounted(&self, namespace: &str, claim: &str) -> Result<bool>;
}

/// Application lifecycle operations of the orchestration platform.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Remove the application that owned the reused volume.
    async fn remove_application(&self, name: &str) -> Result<()>;

    async fn scale(&self, name: &str, replicas: i32) -> Result<()>;
}
