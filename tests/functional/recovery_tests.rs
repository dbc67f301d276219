//! Rebuilding members from the primary and WAL retention.

use pg_ha_supervisor::controller::MemberState;
use pg_ha_supervisor::monitor::ProcessState;

use crate::sim::SimCluster;

#[tokio::test(start_paused = true)]
async fn test_wiped_replica_is_cloned_from_primary() {
    let mut cluster = SimCluster::new(3);
    cluster.elect(5).await;
    cluster.write(2);
    cluster.run(2).await;
    assert_eq!(cluster.member("pg-2").status().wal_position, Some(4));

    cluster.member("pg-2").db.wipe();
    cluster.write(2);
    cluster.tick().await;

    let rebuilt = cluster.member("pg-2");
    assert!(!rebuilt.status().blocked);
    assert!(rebuilt.db.has_data());
    assert_eq!(rebuilt.db.process(), ProcessState::Running);
    assert_eq!(rebuilt.db.actions().last().map(String::as_str), Some("restart"));
    assert!(rebuilt.db.actions().contains(&"clone:pg-0:8008".to_string()));
    // Segments after the last replayed one came from the primary
    assert_eq!(rebuilt.ctx.wal.read().await.current_segment(), 6);

    cluster.tick().await;
    assert_eq!(cluster.member("pg-2").db.segment(), 6);
    assert_eq!(cluster.primary(), Some("pg-0".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_data_gap_blocks_until_unblocked() {
    let mut cluster = SimCluster::with_keep_segments(3, 2);
    cluster.elect(5).await;

    // pg-2 is gone long enough for the primary to stop retaining WAL for it
    cluster.crash_supervisor("pg-2");
    cluster.member("pg-2").db.wipe();
    let history = cluster.member("pg-2").db.actions().len();
    for _ in 0..6 {
        cluster.write(2);
        cluster.tick().await;
    }
    let oldest = cluster.member("pg-0").ctx.wal.read().await.oldest_retained();
    assert!(oldest > Some(2), "primary still retains segment 2: {:?}", oldest);

    cluster.start_supervisor("pg-2");
    cluster.tick().await;

    let blocked = cluster.member("pg-2");
    assert!(blocked.ctx.is_blocked());
    assert!(blocked.status().blocked);
    assert_eq!(blocked.db.actions().len(), history);
    assert!(!blocked.db.has_data());

    // Stays put without an operator, and never stands for election
    cluster.run(3).await;
    let blocked = cluster.member("pg-2");
    assert!(blocked.status().blocked);
    assert_eq!(blocked.db.actions().len(), history);
    assert_eq!(blocked.state(), Some(MemberState::Replica));

    // After an unblock it is rebuilt from a full copy
    assert!(cluster.member("pg-2").ctx.unblock());
    cluster.tick().await;

    let primary_segment = cluster.member("pg-0").ctx.wal.read().await.current_segment();
    let rebuilt = cluster.member("pg-2");
    assert!(!rebuilt.status().blocked);
    assert_eq!(rebuilt.db.actions()[history..], ["clone:pg-0:8008", "restart"]);
    assert_eq!(rebuilt.db.process(), ProcessState::Running);
    assert_eq!(rebuilt.ctx.wal.read().await.current_segment(), primary_segment);

    cluster.tick().await;
    assert_eq!(cluster.member("pg-2").db.segment(), primary_segment);
}

#[tokio::test(start_paused = true)]
async fn test_lagging_replica_pins_wal_until_caught_up() {
    let mut cluster = SimCluster::with_keep_segments(3, 2);
    cluster.elect(5).await;
    cluster.run(2).await;

    // pg-2 keeps reporting segment 2 while its server is stopped
    cluster.member("pg-2").db.freeze();
    for _ in 0..4 {
        cluster.write(2);
        cluster.tick().await;
    }
    {
        let wal = cluster.member("pg-0").ctx.wal.read().await;
        assert_eq!(wal.current_segment(), 10);
        assert_eq!(wal.acknowledged("pg-2"), Some(2));
        assert_eq!(wal.oldest_retained(), Some(3));
    }

    cluster.member("pg-2").db.thaw();
    for _ in 0..4 {
        cluster.write(1);
        cluster.tick().await;
    }
    let wal = cluster.member("pg-0").ctx.wal.read().await;
    assert!(wal.acknowledged("pg-2") >= Some(11));
    assert!(wal.oldest_retained() >= Some(11));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_replica_stops_pinning_wal() {
    let mut cluster = SimCluster::with_keep_segments(3, 2);
    cluster.elect(5).await;
    cluster.run(2).await;

    cluster.freeze_supervisor("pg-2");
    for _ in 0..6 {
        cluster.write(2);
        cluster.tick().await;
    }
    let wal = cluster.member("pg-0").ctx.wal.read().await;
    assert_eq!(wal.acknowledged("pg-2"), None);
    assert!(wal.oldest_retained() > Some(3));
}
