//! Local database access.
//!
//! [`AdminChannel`] is the administrative command channel (WAL switch,
//! checkpoint, WAL positions). [`Workload`] drives the database process
//! itself: promote, demote, restart and clone.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::controller::error::{Error, Result};
use crate::wal::WalFileName;

/// Bytes per WAL segment (16 MiB).
const WAL_SEGMENT_SHIFT: u32 = 24;

/// Segment number holding a textual LSN such as `0/3000060`.
pub fn segment_of_lsn(lsn: &str) -> Result<u64> {
    let (high, low) = lsn
        .trim()
        .split_once('/')
        .ok_or_else(|| Error::Validation(format!("invalid LSN: {}", lsn)))?;
    let high = u64::from_str_radix(high, 16)
        .map_err(|_| Error::Validation(format!("invalid LSN: {}", lsn)))?;
    let low = u64::from_str_radix(low, 16)
        .map_err(|_| Error::Validation(format!("invalid LSN: {}", lsn)))?;
    Ok(((high << 32) | low) >> WAL_SEGMENT_SHIFT)
}

/// Administrative commands against the local database.
#[async_trait]
pub trait AdminChannel: Send + Sync {
    /// Force a WAL switch; returns the segment that was closed.
    async fn switch_wal(&self) -> Result<u64>;

    async fn checkpoint(&self) -> Result<()>;

    /// Segment currently being written (primary only).
    async fn current_segment(&self) -> Result<u64>;

    /// Last segment replayed by a standby, `None` on a primary.
    async fn replayed_segment(&self) -> Result<Option<u64>>;

    /// Whether the database accepts connections.
    async fn is_ready(&self) -> bool;

    /// Identifier stamped into the data directory when it was initialised.
    /// Clones share it with their source.
    async fn system_identifier(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// [`AdminChannel`] over a PostgreSQL connection.
#[derive(Debug, Clone)]
pub struct PostgresAdmin {
    config: tokio_postgres::Config,
}

impl PostgresAdmin {
    pub fn new(database: &DatabaseConfig, connect_timeout: Duration) -> Self {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&database.host)
            .port(database.port)
            .user(&database.user)
            .dbname(&database.dbname)
            .application_name("pg-ha-supervisor")
            .connect_timeout(connect_timeout);
        if let Some(password) = &database.password {
            config.password(password);
        }
        Self { config }
    }

    async fn connect(&self) -> Result<Client> {
        let (client, connection) = self.config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Admin connection closed with error");
            }
        });
        Ok(client)
    }

    async fn query_text(&self, sql: &str) -> Result<Option<String>> {
        let client = self.connect().await?;
        let row = client.query_one(sql, &[]).await?;
        Ok(row.try_get::<_, Option<String>>(0)?)
    }
}

#[async_trait]
impl AdminChannel for PostgresAdmin {
    async fn switch_wal(&self) -> Result<u64> {
        let name = self
            .query_text("SELECT pg_walfile_name(pg_switch_wal())")
            .await?
            .ok_or_else(|| Error::MissingField("pg_walfile_name".into()))?;
        let file: WalFileName = name
            .parse()
            .map_err(|e| Error::Validation(format!("{}", e)))?;
        info!(wal_file = %file, "Forced WAL switch");
        Ok(file.segment)
    }

    async fn checkpoint(&self) -> Result<()> {
        let client = self.connect().await?;
        client.batch_execute("CHECKPOINT").await?;
        Ok(())
    }

    async fn current_segment(&self) -> Result<u64> {
        let lsn = self
            .query_text("SELECT pg_current_wal_lsn()::text")
            .await?
            .ok_or_else(|| Error::MissingField("pg_current_wal_lsn".into()))?;
        segment_of_lsn(&lsn)
    }

    async fn replayed_segment(&self) -> Result<Option<u64>> {
        // NULL outside recovery
        match self.query_text("SELECT pg_last_wal_replay_lsn()::text").await? {
            Some(lsn) => Ok(Some(segment_of_lsn(&lsn)?)),
            None => Ok(None),
        }
    }

    async fn system_identifier(&self) -> Result<Option<u64>> {
        let client = self.connect().await?;
        let row = client
            .query_one("SELECT system_identifier FROM pg_control_system()", &[])
            .await?;
        // bigint column; the identifier is an unsigned 64-bit value
        Ok(row.try_get::<_, Option<i64>>(0)?.map(|id| id as u64))
    }

    async fn is_ready(&self) -> bool {
        match self.connect().await {
            Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
            Err(e) => {
                debug!(error = %e, "Database not accepting connections");
                false
            }
        }
    }
}

/// Actions on the local database process.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn promote(&self) -> Result<()>;

    /// Turn the database into a standby, following `leader` when known.
    async fn demote(&self, leader: Option<&str>) -> Result<()>;

    async fn restart(&self) -> Result<()>;

    /// Rebuild the data directory from the primary at `leader`.
    async fn clone_from_leader(&self, leader: &str) -> Result<()>;

    /// Whether the data directory holds a database cluster.
    async fn data_present(&self) -> bool;
}

/// [`Workload`] that runs configured shell commands.
#[derive(Debug, Clone)]
pub struct CommandWorkload {
    data_dir: PathBuf,
    promote_command: String,
    demote_command: String,
    restart_command: String,
    clone_command: String,
}

/// Host part of a `host:port` peer address.
fn leader_host(address: &str) -> &str {
    let address = address
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => address,
    }
}

impl CommandWorkload {
    pub fn new(database: &DatabaseConfig) -> Self {
        Self {
            data_dir: database.data_dir.clone(),
            promote_command: database.promote_command.clone(),
            demote_command: database.demote_command.clone(),
            restart_command: database.restart_command.clone(),
            clone_command: database.clone_command.clone(),
        }
    }

    async fn run(&self, action: &'static str, command: &str, leader: Option<&str>) -> Result<()> {
        debug!(action, command, "Running workload command");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env("PGDATA", &self.data_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(leader) = leader {
            cmd.env("LEADER_HOST", leader_host(leader));
        }
        let output = cmd.output().await?;
        if output.status.success() {
            info!(action, "Workload action completed");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr.lines().last().unwrap_or_default().to_string();
        warn!(action, status = ?output.status.code(), stderr = %tail, "Workload action failed");
        Err(Error::Workload(format!(
            "{} exited with {:?}: {}",
            action,
            output.status.code(),
            tail
        )))
    }
}

#[async_trait]
impl Workload for CommandWorkload {
    async fn promote(&self) -> Result<()> {
        self.run("promote", &self.promote_command, None).await
    }

    async fn demote(&self, leader: Option<&str>) -> Result<()> {
        self.run("demote", &self.demote_command, leader).await
    }

    async fn restart(&self) -> Result<()> {
        self.run("restart", &self.restart_command, None).await
    }

    async fn clone_from_leader(&self, leader: &str) -> Result<()> {
        self.run("clone", &self.clone_command, Some(leader)).await
    }

    async fn data_present(&self) -> bool {
        tokio::fs::try_exists(self.data_dir.join("PG_VERSION"))
            .await
            .unwrap_or(false)
    }
}
