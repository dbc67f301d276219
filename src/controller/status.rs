//! Member and cluster status reporting.
//!
//! `MemberStatus` is what a member serves on `GET /member` and what peers
//! read during heartbeats. `ClusterStatus` is the operator-facing summary.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::state_machine::MemberState;
use crate::registry::{MemberView, Role};

/// Status of one member as published to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub id: String,
    pub address: String,
    pub role: Role,
    pub state: MemberState,
    /// Term of the lease this member last held or observed.
    pub lease_term: u64,
    pub timeline: u32,
    /// Newest WAL segment written (primary) or replayed (replica).
    pub wal_position: Option<u64>,
    /// Whether the write gate is open.
    pub writes_open: bool,
    /// Automatic promotion halted after a data gap.
    pub blocked: bool,
    /// Could stand for election: a replica with a running database and data,
    /// not blocked.
    #[serde(default)]
    pub electable: bool,
    /// Database system identifier of the local data directory.
    #[serde(default)]
    pub system_id: Option<u64>,
    /// This member's registry view, for gossip.
    #[serde(default)]
    pub members: Vec<MemberView>,
}

impl MemberStatus {
    /// Status of a member that has not completed a cycle yet.
    pub fn initial(id: &str, address: &str) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            role: Role::Unknown,
            state: MemberState::Unknown,
            lease_term: 0,
            timeline: 1,
            wal_position: None,
            writes_open: false,
            blocked: false,
            electable: false,
            system_id: None,
            members: Vec::new(),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.state == MemberState::Primary && self.writes_open
    }
}

/// Cluster health summary shown to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterStatus {
    /// A primary is serving writes.
    Active { primary: String },
    /// No primary; an election is expected to resolve it.
    Electing,
    /// Automatic promotion halted; an operator must act.
    Blocked,
}

impl ClusterStatus {
    /// Derive the cluster status from this member's view.
    pub fn evaluate(blocked: bool, primary: Option<&str>) -> Self {
        if blocked {
            return ClusterStatus::Blocked;
        }
        match primary {
            Some(p) => ClusterStatus::Active {
                primary: p.to_string(),
            },
            None => ClusterStatus::Electing,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, ClusterStatus::Active { .. })
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterStatus::Active { .. } => write!(f, "active"),
            ClusterStatus::Electing => write!(f, "no primary, electing"),
            ClusterStatus::Blocked => write!(f, "blocked: manual intervention required"),
        }
    }
}

impl Serialize for ClusterStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
