//! Failover scenarios: who becomes primary, and when.

use std::time::Duration;

use pg_ha_supervisor::controller::MemberState;
use pg_ha_supervisor::monitor::ProcessState;

use crate::sim::{DbRole, SimCluster};

fn id(s: &str) -> Option<String> {
    Some(s.to_string())
}

// =============================================================================
// Bootstrap
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_bootstrap_elects_single_primary() {
    let mut cluster = SimCluster::new(3);

    let primary = cluster.elect(5).await;
    assert_eq!(primary, "pg-0");
    assert_eq!(cluster.lease().await, Some(("pg-0".to_string(), 1)));
    assert_eq!(cluster.member("pg-0").db.actions(), vec!["promote"]);
    assert_eq!(cluster.member("pg-0").status().timeline, 2);

    cluster.run(2).await;
    for replica in ["pg-1", "pg-2"] {
        let member = cluster.member(replica);
        assert_eq!(member.state(), Some(MemberState::Replica));
        assert!(!member.is_writable());
        assert_eq!(member.db.role(), DbRole::Standby);
        assert!(member.db.actions().contains(&"demote:pg-0:8008".to_string()));
        assert_eq!(member.status().timeline, 2);
    }
    assert_eq!(cluster.primary(), id("pg-0"));
}

#[tokio::test(start_paused = true)]
async fn test_steady_state_keeps_term() {
    let mut cluster = SimCluster::new(3);
    cluster.elect(5).await;

    cluster.run(20).await;
    assert_eq!(cluster.primary(), id("pg-0"));
    assert_eq!(cluster.lease().await, Some(("pg-0".to_string(), 1)));
    assert_eq!(cluster.member("pg-0").db.actions(), vec!["promote"]);
}

// =============================================================================
// Database failures on the primary
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_primary_crash_fails_over() {
    let mut cluster = SimCluster::new(3);
    cluster.elect(5).await;
    cluster.run(1).await;

    cluster.member("pg-0").db.kill();
    cluster.tick().await;

    assert_eq!(cluster.primary(), id("pg-1"));
    assert_eq!(cluster.lease().await, Some(("pg-1".to_string(), 2)));

    // The old primary fenced itself and came back as a standby
    let old = cluster.member("pg-0");
    assert_eq!(old.state(), Some(MemberState::Replica));
    assert!(!old.is_writable());
    assert_eq!(old.db.process(), ProcessState::Running);
    assert_eq!(old.db.role(), DbRole::Standby);
    assert_eq!(old.db.actions(), vec!["promote", "demote:none"]);

    // Once the restart backoff passes it follows the new primary
    let repointed = cluster
        .run_until(5, |c| {
            c.member("pg-0")
                .db
                .actions()
                .contains(&"demote:pg-1:8008".to_string())
        })
        .await;
    assert!(repointed.is_some());
    assert_eq!(cluster.primary(), id("pg-1"));
}

#[tokio::test(start_paused = true)]
async fn test_frozen_primary_database_is_not_restarted() {
    let mut cluster = SimCluster::new(3);
    cluster.elect(5).await;
    cluster.run(1).await;

    cluster.member("pg-0").db.freeze();
    cluster.tick().await;

    assert_eq!(cluster.primary(), id("pg-1"));
    let old = cluster.member("pg-0");
    assert_eq!(old.state(), Some(MemberState::Replica));
    assert_eq!(old.db.process(), ProcessState::Stopped);

    // Nothing touches a stopped server
    cluster.run(3).await;
    assert_eq!(cluster.member("pg-0").db.actions(), vec!["promote"]);
    assert_eq!(cluster.member("pg-0").db.role(), DbRole::Primary);

    // Once it resumes it must rejoin as a standby of the new primary
    cluster.member("pg-0").db.thaw();
    cluster.tick().await;

    let old = cluster.member("pg-0");
    assert_eq!(old.db.role(), DbRole::Standby);
    assert_eq!(
        old.db.actions().last().map(String::as_str),
        Some("demote:pg-1:8008")
    );
    assert_eq!(cluster.primary(), id("pg-1"));
}

#[tokio::test(start_paused = true)]
async fn test_lagging_replica_does_not_win_election() {
    let mut cluster = SimCluster::new(3);
    cluster.elect(5).await;
    cluster.run(1).await;

    // pg-1 stops streaming while pg-2 keeps up
    cluster.cut("pg-0", "pg-1");
    cluster.write(3);
    cluster.run(2).await;
    let lagging = cluster.member("pg-1").db.segment();
    let fresh = cluster.member("pg-2").db.segment();
    assert!(lagging < fresh);
    assert_eq!(cluster.member("pg-2").status().wal_position, Some(fresh));

    cluster.heal();
    cluster.member("pg-0").db.kill();
    cluster.tick().await;

    assert_eq!(cluster.primary(), id("pg-2"));
    assert_eq!(cluster.lease().await, Some(("pg-2".to_string(), 2)));
    assert!(cluster.member("pg-2").status().wal_position >= Some(fresh));
    // pg-1 saw the vacancy first but stood aside
    assert_eq!(cluster.member("pg-1").state(), Some(MemberState::Replica));
    assert!(!cluster.member("pg-1").db.actions().contains(&"promote".to_string()));
}

// =============================================================================
// Supervisor failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_frozen_supervisor_stops_writing_at_lease_deadline() {
    let mut cluster = SimCluster::new(3);
    cluster.elect(5).await;

    cluster.freeze_supervisor("pg-0");
    let taken = cluster
        .run_until(5, |c| c.primary().is_some_and(|p| p != "pg-0"))
        .await;
    assert!(taken.is_some(), "no failover while the primary's supervisor was frozen");
    assert_eq!(cluster.primary(), id("pg-1"));
    assert_eq!(cluster.lease().await, Some(("pg-1".to_string(), 2)));

    // Its loop never ran, yet it no longer accepts writes
    let frozen = cluster.member("pg-0");
    assert_eq!(frozen.state(), Some(MemberState::Primary));
    assert!(!frozen.is_writable());

    cluster.thaw_supervisor("pg-0");
    cluster.tick().await;

    let old = cluster.member("pg-0");
    assert_eq!(old.state(), Some(MemberState::Replica));
    assert_eq!(old.db.role(), DbRole::Standby);
    assert!(old.db.actions().contains(&"demote:pg-1:8008".to_string()));
    assert_eq!(cluster.primary(), id("pg-1"));
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_releases_lease() {
    let mut cluster = SimCluster::new(3);
    cluster.elect(5).await;
    cluster.run(1).await;

    cluster.stop_supervisor("pg-0").await;
    let status = cluster.member("pg-0").status();
    assert_eq!(status.state, MemberState::Unknown);
    assert!(!status.writes_open);
    assert_eq!(cluster.lease().await, None);

    // No need to wait for the ttl
    let taken = cluster.run_until(1, |c| c.primary().is_some()).await;
    assert_eq!(taken, Some(1));
    assert_eq!(cluster.primary(), id("pg-1"));
    assert_eq!(cluster.lease().await, Some(("pg-1".to_string(), 2)));
}

#[tokio::test(start_paused = true)]
async fn test_crashed_supervisor_fails_over_after_ttl() {
    let mut cluster = SimCluster::new(3);
    cluster.elect(5).await;
    cluster.run(1).await;

    cluster.crash_supervisor("pg-0");
    cluster.member("pg-0").db.kill();

    // The lease outlives the crash
    cluster.tick().await;
    assert_eq!(cluster.primary(), None);
    assert_eq!(cluster.lease().await, Some(("pg-0".to_string(), 1)));

    let primary = cluster.elect(5).await;
    assert_ne!(primary, "pg-0");
    assert_eq!(cluster.lease().await.map(|(_, term)| term), Some(2));
}

// =============================================================================
// Whole cluster restarts
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_quick_cluster_restart_keeps_primary() {
    let mut cluster = SimCluster::new(3);
    cluster.elect(5).await;
    cluster.run(1).await;

    for member in cluster.ids() {
        cluster.crash_supervisor(&member);
        cluster.member(&member).db.kill();
    }
    tokio::time::advance(Duration::from_secs(5)).await;
    for member in cluster.ids() {
        cluster.start_supervisor(&member);
    }

    // The holder of the unexpired lease takes it back under the same term
    let primary = cluster.elect(4).await;
    assert_eq!(primary, "pg-0");
    assert_eq!(cluster.lease().await, Some(("pg-0".to_string(), 1)));
}

#[tokio::test(start_paused = true)]
async fn test_cluster_restart_after_outage_starts_new_term() {
    let mut cluster = SimCluster::new(3);
    cluster.elect(5).await;
    cluster.run(1).await;

    for member in cluster.ids() {
        cluster.crash_supervisor(&member);
        cluster.member(&member).db.kill();
    }
    tokio::time::advance(Duration::from_secs(60)).await;
    for member in cluster.ids() {
        cluster.start_supervisor(&member);
    }

    let primary = cluster.elect(4).await;
    assert_eq!(cluster.lease().await, Some((primary.clone(), 2)));

    cluster.run(3).await;
    assert_eq!(cluster.primary(), Some(primary));
    for member in &cluster.members {
        assert_eq!(member.db.process(), ProcessState::Running);
    }
}
