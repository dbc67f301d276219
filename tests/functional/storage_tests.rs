//! Reusing the last primary's volume after scaling the cluster to zero.

use std::sync::Arc;
use std::time::Duration;

use pg_ha_supervisor::controller::Error;
use pg_ha_supervisor::retry::RetryPolicy;
use pg_ha_supervisor::controller::MemberState;
use pg_ha_supervisor::storage::{
    CLUSTER_LABEL, InMemoryStorage, Orchestrator, ReattachState, ReattachmentCoordinator,
    ReclaimPolicy, StorageApi, StorageSnapshot,
};

use crate::sim::{SIM_SYSTEM_ID, SimCluster};

const NS: &str = "db";
const APP: &str = "pg";
const CLAIMS: [&str; 3] = ["data-pg-0", "data-pg-1", "data-pg-2"];

fn policy() -> RetryPolicy {
    RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(1))
}

/// One claim and volume per member, all mounted by the running application.
async fn platform() -> Arc<InMemoryStorage> {
    let storage = Arc::new(InMemoryStorage::new());
    for (ordinal, claim) in CLAIMS.iter().enumerate() {
        storage
            .provision(NS, claim, &format!("pv-{}", ordinal), ReclaimPolicy::Delete)
            .await;
    }
    storage.register_application(APP, NS, &CLAIMS).await;
    storage.scale(APP, 3).await.unwrap();
    storage
}

async fn coordinator(storage: &Arc<InMemoryStorage>, volume: &str, member: &str) -> ReattachmentCoordinator {
    let snapshot = StorageSnapshot::capture(storage.as_ref(), volume, NS, "data-pg-0", Some(member.to_string()))
        .await
        .unwrap();
    ReattachmentCoordinator::new(storage.clone(), storage.clone(), snapshot, policy())
}

#[tokio::test(start_paused = true)]
async fn test_last_primary_volume_becomes_first_ordinal() {
    // The cluster failed over to pg-1 before being scaled down
    let mut cluster = SimCluster::new(3);
    cluster.elect(5).await;
    cluster.member("pg-0").db.kill();
    cluster.tick().await;
    let last_primary = cluster.primary().unwrap();
    assert_eq!(last_primary, "pg-1");

    let storage = platform().await;
    storage.write_data("pv-1", "after-failover").await;

    let mut coordinator = coordinator(&storage, "pv-1", &last_primary)
        .await
        .with_application(APP);
    let bound = coordinator.reuse_volume().await.unwrap();

    assert_eq!(bound.name, "data-pg-0");
    assert_eq!(bound.volume_name.as_deref(), Some("pv-1"));
    assert_eq!(
        coordinator.state(),
        &ReattachState::Bound {
            owner: Some("pg-1".to_string())
        }
    );
    assert_eq!(
        storage.read_claim_data(NS, "data-pg-0").await,
        Some(vec!["after-failover".to_string()])
    );

    // The reused volume keeps its original policy, the stale one is reclaimed
    let volume = storage.get_volume("pv-1").await.unwrap().unwrap();
    assert_eq!(volume.reclaim_policy, ReclaimPolicy::Delete);
    assert!(!storage.volume_exists("pv-0").await);
    assert!(storage.get_claim(NS, "data-pg-1").await.unwrap().is_none());
    assert!(storage.volume_exists("pv-2").await);
}

#[tokio::test(start_paused = true)]
async fn test_mounted_claim_aborts_before_deleting_anything() {
    let storage = platform().await;
    storage.write_data("pv-1", "row").await;

    // Nobody scaled the application down
    let mut coordinator = coordinator(&storage, "pv-1", "pg-1").await;
    let err = coordinator.reuse_volume().await.unwrap_err();
    assert!(matches!(err, Error::StillMounted(_)), "unexpected error: {:?}", err);
    assert_eq!(coordinator.state(), &ReattachState::Unbound);

    // Data is safe: claims intact, volume retained
    let volume = storage.get_volume("pv-1").await.unwrap().unwrap();
    assert_eq!(volume.reclaim_policy, ReclaimPolicy::Retain);
    for claim in CLAIMS {
        assert!(storage.get_claim(NS, claim).await.unwrap().is_some());
    }

    // Retrying once the pods are gone completes the move
    storage.scale(APP, 0).await.unwrap();
    let bound = coordinator.reuse_volume().await.unwrap();
    assert_eq!(bound.volume_name.as_deref(), Some("pv-1"));
    let volume = storage.get_volume("pv-1").await.unwrap().unwrap();
    assert_eq!(volume.reclaim_policy, ReclaimPolicy::Delete);
    assert_eq!(
        storage.read_claim_data(NS, "data-pg-0").await,
        Some(vec!["row".to_string()])
    );
}

#[tokio::test(start_paused = true)]
async fn test_volume_of_another_cluster_is_refused() {
    let storage = platform().await;
    for claim in CLAIMS {
        storage.label_claim(NS, claim, CLUSTER_LABEL, APP).await;
    }
    storage.scale(APP, 0).await.unwrap();

    // A volume left behind by a different database cluster
    storage.provision(NS, "data-other-0", "pv-9", ReclaimPolicy::Delete).await;
    storage.label_claim(NS, "data-other-0", CLUSTER_LABEL, "other").await;
    storage.write_data("pv-9", "foreign-row").await;

    let mut coordinator = coordinator(&storage, "pv-9", "other-0").await;
    let err = coordinator.reuse_volume().await.unwrap_err();
    assert!(matches!(err, Error::ForeignStorage(_)), "unexpected error: {:?}", err);
    assert!(err.is_fatal());

    // Refused before any step ran
    assert!(coordinator.log().is_empty());
    assert_eq!(
        coordinator.state(),
        &ReattachState::Bound {
            owner: Some("other-0".to_string())
        }
    );
    for volume in ["pv-0", "pv-9"] {
        let record = storage.get_volume(volume).await.unwrap().unwrap();
        assert_eq!(record.reclaim_policy, ReclaimPolicy::Delete);
    }
    for claim in CLAIMS.iter().chain(["data-other-0"].iter()) {
        assert!(storage.get_claim(NS, claim).await.unwrap().is_some());
    }
    assert_eq!(
        storage.read_claim_data(NS, "data-other-0").await,
        Some(vec!["foreign-row".to_string()])
    );
}

#[tokio::test(start_paused = true)]
async fn test_foreign_data_directory_blocks_member() {
    let mut cluster = SimCluster::new(3);
    assert_eq!(cluster.elect(5).await, "pg-0");
    cluster.run(1).await;

    // pg-2 comes back with a data directory initialised by another cluster
    cluster.stop_supervisor("pg-2").await;
    cluster.member("pg-2").db.set_system_id(SIM_SYSTEM_ID + 1);
    let history = cluster.member("pg-2").db.actions().len();
    cluster.start_supervisor("pg-2");
    cluster.tick().await;

    let foreign = cluster.member("pg-2");
    assert!(foreign.ctx.is_blocked());
    assert!(foreign.status().blocked);
    assert!(!foreign.status().electable);
    assert_eq!(foreign.status().system_id, Some(SIM_SYSTEM_ID + 1));
    assert_eq!(foreign.db.actions().len(), history);

    // It never stands in for the primary
    cluster.member("pg-0").db.kill();
    cluster.tick().await;
    assert_eq!(cluster.primary(), Some("pg-1".to_string()));
    cluster.run(2).await;
    let foreign = cluster.member("pg-2");
    assert!(foreign.status().blocked);
    assert_eq!(foreign.state(), Some(MemberState::Replica));
    assert_eq!(foreign.db.actions().len(), history);

    // Once the data is replaced and an operator unblocks, it follows again
    cluster.member("pg-2").db.set_system_id(SIM_SYSTEM_ID);
    assert!(cluster.member("pg-2").ctx.unblock());
    cluster.run(2).await;
    let rejoined = cluster.member("pg-2");
    assert!(!rejoined.status().blocked);
    assert!(rejoined.status().electable);
    assert!(
        rejoined.db.actions()[history..].contains(&"demote:pg-1:8008".to_string()),
        "actions: {:?}",
        rejoined.db.actions()
    );
}
