//! pg-ha-supervisor library crate
//!
//! This module exports the failover controller, the leader election and
//! membership layers, WAL bookkeeping, storage reattachment and the REST API.

pub mod api;
pub mod client;
pub mod config;
pub mod controller;
pub mod election;
pub mod health;
pub mod monitor;
pub mod registry;
pub mod retry;
pub mod storage;
pub mod wal;

pub use config::{DynamicSettings, SupervisorConfig};
pub use controller::{Error, FailoverController, Result};
pub use health::HealthState;

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::sync::watch;
use tracing::{error, info};

use api::ApiState;
use client::{
    CommandWorkload, HttpPeerTransport, KubeLeaseBackend, KubeOrchestrator, KubeStorageApi,
    PostgresAdmin,
};
use controller::{Collaborators, Context};
use monitor::ProcfsProbe;
use registry::MembershipRegistry;
use retry::RetryPolicy;
use storage::{ClaimRecord, ReattachmentCoordinator, StorageSnapshot};
use wal::WalManager;

/// Timeout for one peer heartbeat or segment fetch
const PEER_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for connecting to the local database
const DATABASE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time budget for each storage reattachment step
const REATTACH_POLICY: RetryPolicy =
    RetryPolicy::new(Duration::from_secs(120), Duration::from_secs(2));

/// Build the shared context for one member.
pub fn build_context(
    client: Option<Client>,
    config: &SupervisorConfig,
    health_state: Arc<HealthState>,
) -> Arc<Context> {
    let registry = MembershipRegistry::new(
        &config.member_id,
        &config.advertise_address,
        &config.peers,
    );
    Arc::new(Context::new(
        client,
        &config.namespace,
        registry,
        WalManager::new(config.settings.wal_keep_segments),
        &config.advertise_address,
        config.settings,
        health_state,
    ))
}

/// Run the supervisor for one member until `shutdown` fires.
///
/// Starts the REST API and the failover control loop. On shutdown the loop
/// fences the member and releases the leader lease before returning.
pub async fn run_supervisor(
    client: Client,
    config: SupervisorConfig,
    health_state: Arc<HealthState>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        member = %config.member_id,
        cluster = %config.cluster_name,
        peers = config.peers.len(),
        lease = %config.lease_name(),
        "Starting supervisor"
    );

    let ctx = build_context(Some(client.clone()), &config, health_state);
    let admin = Arc::new(PostgresAdmin::new(
        &config.database,
        DATABASE_CONNECT_TIMEOUT,
    ));
    let deps = Collaborators {
        lease_backend: Arc::new(KubeLeaseBackend::new(
            client,
            &config.namespace,
            &config.lease_name(),
            &config.cluster_name,
        )),
        peers: Arc::new(HttpPeerTransport::new(PEER_TIMEOUT)?),
        admin: admin.clone(),
        workload: Arc::new(CommandWorkload::new(&config.database)),
        probe: Arc::new(ProcfsProbe::new(
            config.proc_root.clone(),
            config.database.process_name.clone(),
        )),
    };

    let api_handle = {
        let state = ApiState {
            ctx: ctx.clone(),
            admin,
        };
        let address = config.api_address;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = api::run_api_server(state, address, shutdown).await {
                error!("REST API server error: {}", e);
            }
        })
    };

    let controller = FailoverController::new(ctx, deps, config.restart_backoff);
    let result = controller.run(shutdown).await;

    if let Err(e) = api_handle.await {
        error!("REST API task panicked: {}", e);
    }
    info!("Supervisor stopped");
    result
}

/// Inputs of a scale-to-zero volume reuse
#[derive(Debug, Clone)]
pub struct ReuseRequest {
    /// Persistent volume holding the data to keep
    pub volume: String,
    /// Namespace of the claim that takes over the volume
    pub namespace: String,
    /// Claim that takes over the volume
    pub claim: String,
    /// Member that last ran on the volume
    pub member: Option<String>,
    /// Workload scaled down and removed before the rebind
    pub application: Option<String>,
}

/// Move a retained volume to a new claim with the application scaled down.
pub async fn reuse_storage(
    client: Client,
    request: &ReuseRequest,
    health_state: &HealthState,
) -> Result<ClaimRecord> {
    let storage = Arc::new(KubeStorageApi::new(client.clone()));
    let orchestrator = Arc::new(KubeOrchestrator::new(client, &request.namespace));
    let snapshot = StorageSnapshot::capture(
        storage.as_ref(),
        &request.volume,
        &request.namespace,
        &request.claim,
        request.member.clone(),
    )
    .await?;
    info!(
        volume = %request.volume,
        claim = %request.claim,
        binding = ?snapshot.binding(),
        "Captured storage snapshot"
    );

    let mut coordinator =
        ReattachmentCoordinator::new(storage, orchestrator, snapshot, REATTACH_POLICY);
    if let Some(application) = &request.application {
        coordinator = coordinator.with_application(application.clone());
    }

    match coordinator.reuse_volume().await {
        Ok(claim) => {
            health_state.metrics.record_reattachment("succeeded");
            info!(volume = %request.volume, claim = %claim.name, "Volume reattached");
            Ok(claim)
        }
        Err(e) => {
            health_state.metrics.record_reattachment("failed");
            error!(
                volume = %request.volume,
                state = %coordinator.state(),
                error = %e,
                "Volume reattachment failed"
            );
            Err(e)
        }
    }
}
