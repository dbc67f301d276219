//! Leader election against a real `coordination.k8s.io/v1` Lease.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::coordination::v1::Lease;
use kube::api::Api;

use pg_ha_supervisor::client::KubeLeaseBackend;
use pg_ha_supervisor::controller::Error;
use pg_ha_supervisor::election::LeaderElection;

use crate::{TestNamespace, client};

const LEASE: &str = "orders-leader";
const TTL: Duration = Duration::from_secs(15);

fn election(ns: &TestNamespace) -> LeaderElection {
    let backend = KubeLeaseBackend::new(ns.client(), ns.name(), LEASE, "orders");
    LeaderElection::new(Arc::new(backend), Duration::from_secs(5))
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a Kubernetes cluster"]
async fn test_lease_single_holder() {
    let ns = TestNamespace::create(client().await, "pgha-lease").await;
    let a = election(&ns);
    let b = election(&ns);

    let lease = a.acquire("pg-0", TTL).await.unwrap();
    assert_eq!(lease.term, 1);
    match b.acquire("pg-1", TTL).await {
        Err(Error::LeaseHeld { holder, term }) => {
            assert_eq!(holder, "pg-0");
            assert_eq!(term, 1);
        }
        other => panic!("expected LeaseHeld, got {:?}", other),
    }

    // The term is stored as the lease transition count
    let stored = Api::<Lease>::namespaced(ns.client(), ns.name())
        .get(LEASE)
        .await
        .unwrap();
    let spec = stored.spec.unwrap();
    assert_eq!(spec.holder_identity.as_deref(), Some("pg-0"));
    assert_eq!(spec.lease_transitions, Some(1));
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a Kubernetes cluster"]
async fn test_lease_renew_keeps_term() {
    let ns = TestNamespace::create(client().await, "pgha-lease").await;
    let a = election(&ns);

    let lease = a.acquire("pg-0", TTL).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let renewed = a.renew(&lease).await.unwrap();
    assert_eq!(renewed.term, lease.term);
    assert!(renewed.expires_at > lease.expires_at);

    let observed = a.observe().await.unwrap().unwrap();
    assert!(observed.is_held_by("pg-0"));
    assert!(!observed.is_expired());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a Kubernetes cluster"]
async fn test_lease_release_hands_over() {
    let ns = TestNamespace::create(client().await, "pgha-lease").await;
    let a = election(&ns);
    let b = election(&ns);

    let lease = a.acquire("pg-0", TTL).await.unwrap();
    a.release(&lease).await.unwrap();
    assert!(a.observe().await.unwrap().is_none());

    let next = b.acquire("pg-1", TTL).await.unwrap();
    assert_eq!(next.term, 2);
    assert!(matches!(a.renew(&lease).await, Err(Error::LeaseExpired(_))));
}
