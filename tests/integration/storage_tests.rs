//! Volume and claim operations against a real API server.
//!
//! Volumes are statically provisioned `hostPath` volumes with an empty
//! storage class, so they bind without a provisioner.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ObjectMeta, PostParams};

use pg_ha_supervisor::client::{KubeOrchestrator, KubeStorageApi};
use pg_ha_supervisor::retry::RetryPolicy;
use pg_ha_supervisor::storage::{
    ReattachState, ReattachmentCoordinator, ReclaimPolicy, StorageApi, StorageSnapshot,
};

use crate::{TestNamespace, client};

/// Create a volume pre-bound to `claim` and the claim itself.
async fn bound_pair(ns: &TestNamespace, volume: &str, claim: &str) {
    let capacity: BTreeMap<String, Quantity> =
        [("storage".to_string(), Quantity("1Gi".to_string()))].into();
    let pv = PersistentVolume {
        metadata: ObjectMeta {
            name: Some(volume.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(capacity.clone()),
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            persistent_volume_reclaim_policy: Some("Delete".to_string()),
            storage_class_name: Some(String::new()),
            host_path: Some(HostPathVolumeSource {
                path: format!("/tmp/{}", volume),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            claim_ref: Some(ObjectReference {
                namespace: Some(ns.name().to_string()),
                name: Some(claim.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    ns.track_volume(volume);
    Api::<PersistentVolume>::all(ns.client())
        .create(&PostParams::default(), &pv)
        .await
        .unwrap();

    let pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim.to_string()),
            labels: Some([("app".to_string(), "pg".to_string())].into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: Some(String::new()),
            volume_name: Some(volume.to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(capacity),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    Api::<PersistentVolumeClaim>::namespaced(ns.client(), ns.name())
        .create(&PostParams::default(), &pvc)
        .await
        .unwrap();
}

/// Poll until the claim reports the `Bound` phase.
async fn wait_bound(ns: &TestNamespace, claim: &str) {
    let api = Api::<PersistentVolumeClaim>::namespaced(ns.client(), ns.name());
    for _ in 0..60 {
        let phase = api
            .get(claim)
            .await
            .unwrap()
            .status
            .and_then(|s| s.phase);
        if phase.as_deref() == Some("Bound") {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("claim {} never bound", claim);
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a Kubernetes cluster"]
async fn test_storage_api_reads_and_patches() {
    let ns = TestNamespace::create(client().await, "pgha-storage").await;
    let volume = ns.scoped("pv-0");
    bound_pair(&ns, &volume, "data-pg-0").await;
    wait_bound(&ns, "data-pg-0").await;

    let api = KubeStorageApi::new(ns.client());
    let record = api.get_volume(&volume).await.unwrap().unwrap();
    assert_eq!(record.reclaim_policy, ReclaimPolicy::Delete);
    assert_eq!(
        record.claim_ref.as_ref().map(|r| r.name.as_str()),
        Some("data-pg-0")
    );

    api.set_reclaim_policy(&volume, ReclaimPolicy::Retain)
        .await
        .unwrap();
    let record = api.get_volume(&volume).await.unwrap().unwrap();
    assert_eq!(record.reclaim_policy, ReclaimPolicy::Retain);

    let claim = api.get_claim(ns.name(), "data-pg-0").await.unwrap().unwrap();
    assert_eq!(claim.volume_name.as_deref(), Some(volume.as_str()));
    assert_eq!(claim.labels.get("app").map(String::as_str), Some("pg"));
    assert!(!api.is_mounted(ns.name(), "data-pg-0").await.unwrap());

    // Deleting a claim that does not exist is not an error
    api.delete_claim(ns.name(), "data-pg-9").await.unwrap();
    assert!(api.get_volume(&ns.scoped("missing")).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a Kubernetes cluster"]
async fn test_reuse_volume_rebinds_first_ordinal_claim() {
    let ns = TestNamespace::create(client().await, "pgha-storage").await;
    let old = ns.scoped("pv-0");
    let last_primary = ns.scoped("pv-1");
    bound_pair(&ns, &old, "data-pg-0").await;
    bound_pair(&ns, &last_primary, "data-pg-1").await;
    wait_bound(&ns, "data-pg-0").await;
    wait_bound(&ns, "data-pg-1").await;

    let storage = Arc::new(KubeStorageApi::new(ns.client()));
    let orchestrator = Arc::new(KubeOrchestrator::new(ns.client(), ns.name()));
    let snapshot = StorageSnapshot::capture(
        storage.as_ref(),
        &last_primary,
        ns.name(),
        "data-pg-0",
        Some("pg-1".to_string()),
    )
    .await
    .unwrap();
    let mut coordinator = ReattachmentCoordinator::new(
        storage.clone(),
        orchestrator,
        snapshot,
        RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(1)),
    );

    let claim = coordinator.reuse_volume().await.unwrap();
    assert_eq!(claim.name, "data-pg-0");
    assert_eq!(claim.volume_name.as_deref(), Some(last_primary.as_str()));
    assert!(matches!(coordinator.state(), ReattachState::Bound { .. }));

    wait_bound(&ns, "data-pg-0").await;
    let volume = storage.get_volume(&last_primary).await.unwrap().unwrap();
    assert_eq!(volume.reclaim_policy, ReclaimPolicy::Delete);
    assert_eq!(
        volume.claim_ref.as_ref().map(|r| r.name.as_str()),
        Some("data-pg-0")
    );
    assert!(storage.get_claim(ns.name(), "data-pg-1").await.unwrap().is_none());
}
