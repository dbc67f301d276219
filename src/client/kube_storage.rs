//! Kubernetes implementations of the storage and orchestration traits.
//!
//! Volumes map to `PersistentVolume`, claims to `PersistentVolumeClaim`,
//! and the application to the cluster's `StatefulSet`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use super::FIELD_MANAGER;
use crate::controller::error::{Error, Result};
use crate::storage::{
    ClaimRecord, ClaimReference, Orchestrator, ReclaimPolicy, StorageApi, VolumeRecord,
};

/// Storage API backed by the Kubernetes core/v1 volume objects.
pub struct KubeStorageApi {
    client: Client,
}

impl KubeStorageApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Convert a `PersistentVolume` into a volume record.
pub fn volume_record(pv: &PersistentVolume) -> Result<VolumeRecord> {
    let spec = pv.spec.clone().unwrap_or_default();
    let reclaim_policy = ReclaimPolicy::parse(
        spec.persistent_volume_reclaim_policy
            .as_deref()
            .unwrap_or("Delete"),
    )?;
    let claim_ref = spec.claim_ref.and_then(|r| {
        Some(ClaimReference {
            namespace: r.namespace?,
            name: r.name?,
            uid: r.uid,
        })
    });
    Ok(VolumeRecord {
        name: pv.name_any(),
        uid: pv.uid(),
        reclaim_policy,
        claim_ref,
        host_path: spec.host_path.map(|h| h.path),
    })
}

/// Convert a `PersistentVolumeClaim` into a claim record.
pub fn claim_record(pvc: &PersistentVolumeClaim) -> ClaimRecord {
    let spec = pvc.spec.clone().unwrap_or_default();
    ClaimRecord {
        name: pvc.name_any(),
        namespace: pvc.namespace().unwrap_or_default(),
        uid: pvc.uid(),
        resource_version: pvc.resource_version(),
        labels: pvc.labels().clone(),
        annotations: pvc.annotations().clone(),
        volume_name: spec.volume_name,
        storage_class: spec.storage_class_name,
        access_modes: spec.access_modes.unwrap_or_default(),
        storage_request: spec
            .resources
            .and_then(|r| r.requests)
            .and_then(|mut requests| requests.remove("storage"))
            .map(|q| q.0),
    }
}

/// Build the `PersistentVolumeClaim` to apply for a claim record.
///
/// Only identity, metadata and spec are set; `uid`, `resourceVersion` and
/// managed fields are left to the API server.
pub fn claim_object(claim: &ClaimRecord) -> PersistentVolumeClaim {
    let requests = claim.storage_request.as_ref().map(|size| {
        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(size.clone()));
        requests
    });
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim.name.clone()),
            namespace: Some(claim.namespace.clone()),
            labels: (!claim.labels.is_empty()).then(|| claim.labels.clone()),
            annotations: (!claim.annotations.is_empty()).then(|| claim.annotations.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: (!claim.access_modes.is_empty()).then(|| claim.access_modes.clone()),
            storage_class_name: claim.storage_class.clone(),
            volume_name: claim.volume_name.clone(),
            resources: requests.map(|requests| VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_mounts_claim(pod: &Pod, claim: &str) -> bool {
    let finished = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Succeeded" || p == "Failed");
    if finished {
        return false;
    }
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|volumes| {
            volumes.iter().any(|v| {
                v.persistent_volume_claim
                    .as_ref()
                    .is_some_and(|c| c.claim_name == claim)
            })
        })
}

#[async_trait]
impl StorageApi for KubeStorageApi {
    async fn get_volume(&self, name: &str) -> Result<Option<VolumeRecord>> {
        self.volumes()
            .get_opt(name)
            .await?
            .map(|pv| volume_record(&pv))
            .transpose()
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimRecord>> {
        Ok(self
            .claims(namespace)
            .get_opt(name)
            .await?
            .map(|pvc| claim_record(&pvc)))
    }

    async fn set_reclaim_policy(&self, volume: &str, policy: ReclaimPolicy) -> Result<()> {
        let patch = json!({ "spec": { "persistentVolumeReclaimPolicy": policy.as_str() } });
        self.volumes()
            .patch(volume, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(volume = %volume, policy = %policy, "Updated reclaim policy");
        Ok(())
    }

    async fn clear_claim_ref(&self, volume: &str) -> Result<()> {
        let patch = json!({ "spec": { "claimRef": null } });
        self.volumes()
            .patch(volume, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(volume = %volume, "Cleared claim reference");
        Ok(())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        match self.claims(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(claim = %name, namespace = %namespace, "Deleted claim");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_claim(&self, claim: &ClaimRecord) -> Result<ClaimRecord> {
        let object = claim_object(claim);
        let applied = self
            .claims(&claim.namespace)
            .patch(
                &claim.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&object),
            )
            .await
            .map_err(|e| match e {
                // spec.volumeName is immutable once bound
                kube::Error::Api(ref api) if api.code == 422 || api.code == 409 => {
                    Error::NameConflict(format!("{}/{}: {}", claim.namespace, claim.name, api.message))
                }
                other => Error::Kube(other),
            })?;
        Ok(claim_record(&applied))
    }

    async fn is_mounted(&self, namespace: &str, claim: &str) -> Result<bool> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default()).await?;
        Ok(list.items.iter().any(|pod| pod_mounts_claim(pod, claim)))
    }
}

/// Orchestrator acting on StatefulSets in one namespace.
pub struct KubeOrchestrator {
    api: Api<StatefulSet>,
}

impl KubeOrchestrator {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn remove_application(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::foreground()).await {
            Ok(_) => {
                info!(statefulset = %name, "Removed application");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn scale(&self, name: &str, replicas: i32) -> Result<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(statefulset = %name, replicas, "Scaled application");
        Ok(())
    }
}
