//! Supervisor configuration.
//!
//! Static settings come from the environment (set by the StatefulSet pod
//! template). Timing settings are additionally patchable at runtime through
//! the REST API and reach the control loop over a `watch` channel.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::controller::error::{Error, Result};

/// Default control loop interval in seconds
pub const DEFAULT_LOOP_WAIT_SECS: u64 = 10;
/// Default leader lease TTL in seconds
pub const DEFAULT_TTL_SECS: u64 = 30;
/// Default deadline for a single backend call in seconds
pub const DEFAULT_RETRY_TIMEOUT_SECS: u64 = 10;
/// Default number of closed WAL segments kept beyond replica needs
pub const DEFAULT_WAL_KEEP_SEGMENTS: u64 = 8;
/// Upper bound for every timing setting, in seconds (one day)
pub const MAX_TIMING_SECS: u64 = 86_400;
/// Default REST API port
pub const DEFAULT_API_PORT: u16 = 8008;

/// Timing and retention settings that can be changed while the supervisor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicSettings {
    /// Seconds between control loop cycles (the heartbeat interval).
    pub loop_wait: u64,
    /// Leader lease TTL in seconds.
    pub ttl: u64,
    /// Deadline for a single backend call in seconds.
    pub retry_timeout: u64,
    /// Closed WAL segments kept beyond what replicas still need.
    #[serde(default = "default_wal_keep_segments")]
    pub wal_keep_segments: u64,
}

fn default_wal_keep_segments() -> u64 {
    DEFAULT_WAL_KEEP_SEGMENTS
}

impl Default for DynamicSettings {
    fn default() -> Self {
        Self {
            loop_wait: DEFAULT_LOOP_WAIT_SECS,
            ttl: DEFAULT_TTL_SECS,
            retry_timeout: DEFAULT_RETRY_TIMEOUT_SECS,
            wal_keep_segments: DEFAULT_WAL_KEEP_SEGMENTS,
        }
    }
}

impl DynamicSettings {
    pub fn loop_wait(&self) -> Duration {
        Duration::from_secs(self.loop_wait)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout)
    }

    /// How long the primary may stay silent before replicas start an election.
    pub fn detection_window(&self) -> Duration {
        self.loop_wait().saturating_mul(2)
    }

    /// How long the loop may go without completing a cycle before liveness fails.
    pub fn liveness_window(&self) -> Duration {
        self.loop_wait().saturating_mul(3)
    }

    /// How long a member may stay a candidate before reverting to replica.
    pub fn candidate_timeout(&self) -> Duration {
        self.ttl()
    }

    /// Cap for the election backoff.
    pub fn max_election_backoff(&self) -> Duration {
        self.ttl()
    }

    /// Heartbeats older than this mark a member as unreachable.
    pub fn member_ttl(&self) -> Duration {
        self.ttl()
    }

    /// Check the invariants between the timing settings.
    ///
    /// The lease must survive one missed heartbeat, and a single backend
    /// call must finish well inside the lease. No timing setting may
    /// exceed [`MAX_TIMING_SECS`].
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("loop_wait", self.loop_wait),
            ("ttl", self.ttl),
            ("retry_timeout", self.retry_timeout),
        ] {
            if value > MAX_TIMING_SECS {
                return Err(Error::Validation(format!(
                    "{} ({}s) must not exceed {}s",
                    name, value, MAX_TIMING_SECS
                )));
            }
        }
        if self.loop_wait == 0 {
            return Err(Error::Validation("loop_wait must be at least 1s".into()));
        }
        let min_ttl = self
            .loop_wait
            .checked_mul(2)
            .ok_or_else(|| Error::Validation(format!("loop_wait ({}s) is out of range", self.loop_wait)))?;
        if self.ttl < min_ttl {
            return Err(Error::Validation(format!(
                "ttl ({}s) must be at least twice loop_wait ({}s)",
                self.ttl, self.loop_wait
            )));
        }
        if self.retry_timeout == 0 || self.retry_timeout >= self.ttl {
            return Err(Error::Validation(format!(
                "retry_timeout ({}s) must be between 1s and ttl ({}s)",
                self.retry_timeout, self.ttl
            )));
        }
        Ok(())
    }

    /// Apply a partial update and validate the result.
    pub fn patched(&self, patch: &SettingsPatch) -> Result<Self> {
        let next = Self {
            loop_wait: patch.loop_wait.unwrap_or(self.loop_wait),
            ttl: patch.ttl.unwrap_or(self.ttl),
            retry_timeout: patch.retry_timeout.unwrap_or(self.retry_timeout),
            wal_keep_segments: patch.wal_keep_segments.unwrap_or(self.wal_keep_segments),
        };
        next.validate()?;
        Ok(next)
    }
}

/// Partial update body for `PATCH /config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub loop_wait: Option<u64>,
    pub ttl: Option<u64>,
    pub retry_timeout: Option<u64>,
    pub wal_keep_segments: Option<u64>,
}

/// A configured cluster peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: String,
    /// `host:port` of the peer's REST API.
    pub address: String,
}

/// Parse `id=host:port,id=host:port` into peer entries.
pub fn parse_peers(raw: &str) -> Result<Vec<PeerConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, address) = entry
                .split_once('=')
                .ok_or_else(|| Error::Validation(format!("peer entry '{}' must be id=host:port", entry)))?;
            if id.is_empty() || address.is_empty() {
                return Err(Error::Validation(format!("peer entry '{}' is incomplete", entry)));
            }
            Ok(PeerConfig {
                id: id.to_string(),
                address: address.to_string(),
            })
        })
        .collect()
}

/// Local database settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Host for the administrative connection.
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    /// Data directory (`PGDATA`).
    pub data_dir: PathBuf,
    /// Process name to watch under `/proc`.
    pub process_name: String,
    /// Shell commands run by the workload driver.
    pub promote_command: String,
    pub demote_command: String,
    pub restart_command: String,
    pub clone_command: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            dbname: "postgres".to_string(),
            data_dir: PathBuf::from("/var/lib/postgresql/data/pgdata"),
            process_name: "postgres".to_string(),
            promote_command: "pg_ctl promote -D \"$PGDATA\"".to_string(),
            demote_command: "touch \"$PGDATA/standby.signal\" && pg_ctl restart -D \"$PGDATA\" -m fast".to_string(),
            restart_command: "pg_ctl restart -D \"$PGDATA\" -m fast".to_string(),
            clone_command: "pg_basebackup -D \"$PGDATA\" -h \"$LEADER_HOST\" -X stream -R".to_string(),
        }
    }
}

/// Complete static configuration of one supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// This member's identity (pod name).
    pub member_id: String,
    pub namespace: String,
    /// Cluster name; prefixes the leader lease name.
    pub cluster_name: String,
    /// Address the REST API binds to.
    pub api_address: SocketAddr,
    /// Address peers use to reach this member's REST API.
    pub advertise_address: String,
    /// Other members of the cluster.
    pub peers: Vec<PeerConfig>,
    /// Root of the proc filesystem.
    pub proc_root: PathBuf,
    /// Minimum delay between database restarts.
    pub restart_backoff: Duration,
    pub settings: DynamicSettings,
    pub database: DatabaseConfig,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Validation(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

impl SupervisorConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let member_id = std::env::var("POD_NAME").unwrap_or_else(|_| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        });
        let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
            warn!("POD_NAMESPACE not set, using 'default'");
            "default".to_string()
        });
        let cluster_name = std::env::var("CLUSTER_NAME").map_err(|_| Error::MissingField("CLUSTER_NAME".into()))?;

        let api_address: SocketAddr = env_parse(
            "API_ADDRESS",
            SocketAddr::from(([0, 0, 0, 0], DEFAULT_API_PORT)),
        )?;
        let advertise_address = std::env::var("ADVERTISE_ADDRESS")
            .unwrap_or_else(|_| format!("{}:{}", member_id, api_address.port()));
        let peers = parse_peers(&env_or("PEERS", ""))?
            .into_iter()
            .filter(|p| p.id != member_id)
            .collect();

        let settings = DynamicSettings {
            loop_wait: env_parse("LOOP_WAIT", DEFAULT_LOOP_WAIT_SECS)?,
            ttl: env_parse("TTL", DEFAULT_TTL_SECS)?,
            retry_timeout: env_parse("RETRY_TIMEOUT", DEFAULT_RETRY_TIMEOUT_SECS)?,
            wal_keep_segments: env_parse("WAL_KEEP_SEGMENTS", DEFAULT_WAL_KEEP_SEGMENTS)?,
        };

        let defaults = DatabaseConfig::default();
        let database = DatabaseConfig {
            host: env_or("PGHOST", &defaults.host),
            port: env_parse("PGPORT", defaults.port)?,
            user: env_or("PGUSER", &defaults.user),
            password: std::env::var("PGPASSWORD").ok(),
            dbname: env_or("PGDATABASE", &defaults.dbname),
            data_dir: std::env::var("PGDATA").map(PathBuf::from).unwrap_or(defaults.data_dir),
            process_name: env_or("PG_PROCESS_NAME", &defaults.process_name),
            promote_command: env_or("PROMOTE_COMMAND", &defaults.promote_command),
            demote_command: env_or("DEMOTE_COMMAND", &defaults.demote_command),
            restart_command: env_or("RESTART_COMMAND", &defaults.restart_command),
            clone_command: env_or("CLONE_COMMAND", &defaults.clone_command),
        };

        let config = Self {
            member_id,
            namespace,
            cluster_name,
            api_address,
            advertise_address,
            peers,
            proc_root: PathBuf::from(env_or("PROC_ROOT", "/proc")),
            restart_backoff: Duration::from_secs(env_parse("RESTART_BACKOFF", 30u64)?),
            settings,
            database,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the static configuration.
    pub fn validate(&self) -> Result<()> {
        if self.member_id.trim().is_empty() {
            return Err(Error::Validation("member id must not be empty".into()));
        }
        if self.cluster_name.trim().is_empty() {
            return Err(Error::Validation("cluster name must not be empty".into()));
        }
        if self.peers.iter().any(|p| p.id == self.member_id) {
            return Err(Error::Validation("peer list must not contain this member".into()));
        }
        self.settings.validate()
    }

    /// Name of the Kubernetes Lease used for leader election.
    pub fn lease_name(&self) -> String {
        format!("{}-leader", self.cluster_name)
    }

    /// Total number of configured members including this one.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }
}
