//! pg-ha-supervisor - Per-member failover supervisor for PostgreSQL on Kubernetes.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Loads the configuration from the environment
//! - Creates the Kubernetes client
//! - Runs the failover control loop and REST API until SIGTERM/SIGINT,
//!   or runs a one-shot volume reuse

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::Client;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use pg_ha_supervisor::{HealthState, ReuseRequest, SupervisorConfig, reuse_storage, run_supervisor};

#[derive(Parser, Debug)]
#[command(name = "pg-ha-supervisor")]
#[command(about = "Failover supervisor for highly-available PostgreSQL")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise the local PostgreSQL member (default)
    Run,
    /// Rebind a retained volume to a claim after scaling the cluster to zero
    ReuseStorage {
        /// Persistent volume holding the data to keep
        #[arg(long)]
        volume: String,
        /// Claim that takes over the volume
        #[arg(long)]
        claim: String,
        /// Namespace of the claim
        #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
        namespace: String,
        /// Member that last ran on the volume
        #[arg(long)]
        member: Option<String>,
        /// StatefulSet to scale down and remove before the rebind
        #[arg(long)]
        application: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pg_ha_supervisor=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .json()
        .init();

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            let config = SupervisorConfig::from_env()?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Received shutdown signal, fencing and releasing the lease");
                shutdown_tx.send_replace(true);
            });

            if let Err(e) = run_supervisor(client, config, health_state, shutdown_rx).await {
                error!("Supervisor failed: {}", e);
                return Err(e.into());
            }
        }
        Command::ReuseStorage {
            volume,
            claim,
            namespace,
            member,
            application,
        } => {
            let request = ReuseRequest {
                volume,
                namespace,
                claim,
                member,
                application,
            };
            reuse_storage(client, &request, &health_state).await?;
        }
    }

    info!("pg-ha-supervisor stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Note: Signal handler setup failures are fatal - the supervisor cannot shut down
/// gracefully without them. Using expect() here is intentional.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
