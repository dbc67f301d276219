// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for pg-ha-supervisor.
//!
//! These tests run without a Kubernetes cluster or PostgreSQL and test
//! the public API of individual components in isolation.

mod config_tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use pg_ha_supervisor::config::{
        DatabaseConfig, DynamicSettings, PeerConfig, SettingsPatch, SupervisorConfig, parse_peers,
    };

    pub(crate) fn supervisor_config() -> SupervisorConfig {
        SupervisorConfig {
            member_id: "pg-0".into(),
            namespace: "default".into(),
            cluster_name: "orders".into(),
            api_address: ([127, 0, 0, 1], 8008).into(),
            advertise_address: "pg-0:8008".into(),
            peers: vec![PeerConfig {
                id: "pg-1".into(),
                address: "pg-1:8008".into(),
            }],
            proc_root: PathBuf::from("/proc"),
            restart_backoff: Duration::from_secs(30),
            settings: DynamicSettings::default(),
            database: DatabaseConfig::default(),
        }
    }

    #[test]
    fn test_supervisor_config() {
        let config = supervisor_config();
        config.validate().unwrap();
        assert_eq!(config.lease_name(), "orders-leader");
        assert_eq!(config.cluster_size(), 2);
    }

    #[test]
    fn test_supervisor_config_rejects_self_as_peer() {
        let mut config = supervisor_config();
        config.peers.push(PeerConfig {
            id: "pg-0".into(),
            address: "pg-0:8008".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_peers() {
        let peers = parse_peers("pg-1=pg-1.pg:8008, pg-2=pg-2.pg:8008,").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].id, "pg-1");
        assert_eq!(peers[1].address, "pg-2.pg:8008");
    }

    #[test]
    fn test_parse_peers_empty() {
        assert!(parse_peers("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_peers_rejects_bad_entries() {
        assert!(parse_peers("pg-1").is_err());
        assert!(parse_peers("=pg-1:8008").is_err());
        assert!(parse_peers("pg-1=").is_err());
    }

    #[test]
    fn test_default_settings_are_valid() {
        let settings = DynamicSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.loop_wait, 10);
        assert_eq!(settings.ttl, 30);
        assert_eq!(settings.retry_timeout, 10);
        assert_eq!(settings.wal_keep_segments, 8);
    }

    #[test]
    fn test_patch_keeps_unset_fields() {
        let patched = DynamicSettings::default()
            .patched(&SettingsPatch {
                ttl: Some(60),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(patched.ttl, 60);
        assert_eq!(patched.loop_wait, 10);
    }

    #[test]
    fn test_settings_without_retention_deserialize() {
        let settings: DynamicSettings =
            serde_json::from_str(r#"{"loop_wait": 5, "ttl": 20, "retry_timeout": 5}"#).unwrap();
        assert_eq!(settings.wal_keep_segments, 8);
        settings.validate().unwrap();
    }

    #[test]
    fn test_patch_rejects_short_ttl() {
        let result = DynamicSettings::default().patched(&SettingsPatch {
            loop_wait: Some(20),
            ..Default::default()
        });
        assert!(result.is_err());
    }
}

mod election_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pg_ha_supervisor::controller::Error;
    use pg_ha_supervisor::election::{InMemoryLeaseBackend, LeaderElection, LeaseStore};

    const TTL: Duration = Duration::from_secs(30);

    fn member(store: &Arc<LeaseStore>) -> (LeaderElection, InMemoryLeaseBackend) {
        let backend = InMemoryLeaseBackend::connect(store.clone());
        let election = LeaderElection::new(Arc::new(backend.clone()), Duration::from_secs(10));
        (election, backend)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_winner_per_term() {
        let store = LeaseStore::new();
        let (a, _) = member(&store);
        let (b, _) = member(&store);

        let lease = a.acquire("pg-0", TTL).await.unwrap();
        assert_eq!(lease.term, 1);
        match b.acquire("pg-1", TTL).await {
            Err(Error::LeaseHeld { holder, term }) => {
                assert_eq!(holder, "pg-0");
                assert_eq!(term, 1);
            }
            other => panic!("expected LeaseHeld, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_hands_over_with_new_term() {
        let store = LeaseStore::new();
        let (a, _) = member(&store);
        let (b, _) = member(&store);

        let lease = a.acquire("pg-0", TTL).await.unwrap();
        a.release(&lease).await.unwrap();
        assert!(a.observe().await.unwrap().is_none());

        let next = b.acquire("pg-1", TTL).await.unwrap();
        assert_eq!(next.term, 2);
        // The old holder can no longer renew
        assert!(matches!(a.renew(&lease).await, Err(Error::LeaseExpired(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_can_be_taken() {
        let store = LeaseStore::new();
        let (a, _) = member(&store);
        let (b, _) = member(&store);

        let lease = a.acquire("pg-0", TTL).await.unwrap();
        tokio::time::advance(TTL).await;
        assert!(a.observe().await.unwrap().unwrap().is_expired());

        let next = b.acquire("pg-1", TTL).await.unwrap();
        assert_eq!(next.term, 2);
        assert!(a.renew(&lease).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_backend() {
        let store = LeaseStore::new();
        let (a, backend) = member(&store);
        backend.set_reachable(false);

        assert!(matches!(
            a.acquire("pg-0", TTL).await,
            Err(Error::BackendUnreachable(_))
        ));
        assert!(store.peek().await.is_none());
    }
}

mod wal_tests {
    use pg_ha_supervisor::controller::Error;
    use pg_ha_supervisor::wal::{WalFileName, WalManager};

    #[test]
    fn test_wal_file_name() {
        let name: WalFileName = "000000020000000100000003".parse().unwrap();
        assert_eq!(name.timeline, 2);
        assert_eq!(name.segment, 0x103);
        assert_eq!(name.to_string(), "000000020000000100000003");
    }

    #[test]
    fn test_wal_file_name_rejects_garbage() {
        assert!("0000000200000001".parse::<WalFileName>().is_err());
        assert!("00000002000000010000000G".parse::<WalFileName>().is_err());
    }

    #[test]
    fn test_catch_up_reports_gap() {
        let mut wal = WalManager::new(2);
        wal.sync_to(10).unwrap();

        let segments = wal.catch_up_from(Some(8)).unwrap();
        let numbers: Vec<u64> = segments.iter().map(|s| s.sequence_number).collect();
        assert_eq!(numbers, vec![9, 10]);

        match wal.catch_up_from(Some(3)) {
            Err(Error::DataGap {
                required_from,
                oldest_retained,
            }) => {
                assert_eq!(required_from, 4);
                assert_eq!(oldest_retained, Some(8));
            }
            other => panic!("expected DataGap, got {:?}", other),
        }
        // Without a position everything retained is handed out
        assert_eq!(wal.catch_up_from(None).unwrap().len(), 3);
    }

    #[test]
    fn test_catch_up_rejects_position_out_of_range() {
        let mut wal = WalManager::new(2);
        wal.sync_to(10).unwrap();
        assert!(matches!(wal.catch_up_from(Some(u64::MAX)), Err(Error::Validation(_))));

        // An acknowledgement at the top of the range does not break retention
        wal.acknowledge("pg-1", u64::MAX);
        assert_eq!(wal.effective_floor(), 8);
    }

    #[test]
    fn test_timelines() {
        let mut wal = WalManager::new(4);
        assert_eq!(wal.open_timeline().unwrap(), 2);
        wal.adopt_timeline(1).unwrap();
        assert_eq!(wal.timeline(), 2);
        wal.adopt_timeline(5).unwrap();
        assert_eq!(wal.timeline(), 5);
    }
}

mod registry_tests {
    use tokio::time::Instant;

    use pg_ha_supervisor::config::PeerConfig;
    use pg_ha_supervisor::controller::MemberStatus;
    use pg_ha_supervisor::registry::{MembershipRegistry, Role};

    fn registry() -> MembershipRegistry {
        let peers = vec![
            PeerConfig {
                id: "pg-1".into(),
                address: "pg-1:8008".into(),
            },
            PeerConfig {
                id: "pg-2".into(),
                address: "pg-2:8008".into(),
            },
        ];
        MembershipRegistry::new("pg-0", "pg-0:8008", &peers)
    }

    fn status(id: &str, role: Role, term: u64) -> MemberStatus {
        let mut status = MemberStatus::initial(id, &format!("{}:8008", id));
        status.role = role;
        status.lease_term = term;
        status
    }

    #[test]
    fn test_newer_primary_replaces_older() {
        let mut registry = registry();
        let now = Instant::now();
        registry.heartbeat(&status("pg-1", Role::Primary, 1), now).unwrap();
        registry.heartbeat(&status("pg-2", Role::Primary, 2), now).unwrap();

        assert_eq!(registry.primary().unwrap().id, "pg-2");
        assert_eq!(registry.get("pg-1").unwrap().role, Role::Unknown);

        // A late claim from the old term is ignored
        registry.heartbeat(&status("pg-1", Role::Primary, 1), now).unwrap();
        assert_eq!(registry.primary().unwrap().id, "pg-2");
    }

    #[test]
    fn test_unknown_member_heartbeat_rejected() {
        let mut registry = registry();
        assert!(registry
            .heartbeat(&status("pg-9", Role::Replica, 0), Instant::now())
            .is_err());
    }

    #[test]
    fn test_dynamic_member_expires() {
        let mut registry = registry();
        registry.join("pg-3", "pg-3:8008");
        assert_eq!(registry.len(), 4);

        let now = Instant::now();
        registry.heartbeat(&status("pg-1", Role::Replica, 0), now).unwrap();
        let removed = registry.expire(now, std::time::Duration::from_secs(30));
        assert_eq!(removed, vec!["pg-3".to_string()]);
        // Configured members stay even when silent
        assert!(registry.get("pg-2").is_some());
    }

    #[test]
    fn test_quorum() {
        let mut registry = registry();
        let now = Instant::now();
        let ttl = std::time::Duration::from_secs(30);
        assert!(!registry.is_quorum_reachable(now, ttl));
        registry.heartbeat(&status("pg-1", Role::Replica, 0), now).unwrap();
        assert!(registry.is_quorum_reachable(now, ttl));
    }
}

mod status_tests {
    use pg_ha_supervisor::controller::ClusterStatus;

    #[test]
    fn test_cluster_status() {
        assert_eq!(ClusterStatus::evaluate(false, Some("pg-0")).to_string(), "active");
        assert_eq!(ClusterStatus::evaluate(false, None).to_string(), "no primary, electing");
        assert_eq!(
            ClusterStatus::evaluate(true, Some("pg-0")).to_string(),
            "blocked: manual intervention required"
        );
        assert!(!ClusterStatus::evaluate(false, Some("pg-0")).is_degraded());
        assert!(ClusterStatus::evaluate(true, None).is_degraded());
    }
}

mod api_tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use pg_ha_supervisor::api::{ApiState, create_router};
    use pg_ha_supervisor::client::AdminChannel;
    use pg_ha_supervisor::controller::Result;
    use pg_ha_supervisor::{HealthState, build_context};

    struct IdleAdmin;

    #[async_trait]
    impl AdminChannel for IdleAdmin {
        async fn switch_wal(&self) -> Result<u64> {
            Ok(1)
        }

        async fn checkpoint(&self) -> Result<()> {
            Ok(())
        }

        async fn current_segment(&self) -> Result<u64> {
            Ok(1)
        }

        async fn replayed_segment(&self) -> Result<Option<u64>> {
            Ok(Some(1))
        }

        async fn is_ready(&self) -> bool {
            true
        }
    }

    fn state() -> ApiState {
        let config = super::config_tests::supervisor_config();
        let ctx = build_context(None, &config, Arc::new(HealthState::new()));
        ApiState {
            ctx,
            admin: Arc::new(IdleAdmin),
        }
    }

    async fn get(state: &ApiState, uri: &str) -> (StatusCode, String) {
        let response = create_router(state.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_probes_served_with_api() {
        let state = state();
        let (status, _) = get(&state, "/healthz").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get(&state, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        state.ctx.health_state.set_ready(true).await;
        let (status, _) = get(&state, "/readyz").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = get(&state, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("pgha_"));
    }

    #[tokio::test]
    async fn test_cluster_lists_configured_members() {
        let state = state();
        let (status, body) = get(&state, "/cluster").await;
        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body).unwrap();
        let ids: Vec<&str> = body["members"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["pg-0", "pg-1"]);
        assert!(body["primary"].is_null());
    }

    #[tokio::test]
    async fn test_config_reflects_settings() {
        let state = state();
        let (status, body) = get(&state, "/config").await;
        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["loop_wait"], 10);
        assert_eq!(body["ttl"], 30);
    }
}
