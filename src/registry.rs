//! Cluster membership registry.
//!
//! Each member keeps its own registry, fed by heartbeats to its peers. The
//! registry never holds two primaries: recording a primary demotes any
//! other primary to `unknown`. Zero primaries is allowed while an election
//! is in progress.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::controller::error::{Error, Result};
use crate::controller::status::MemberStatus;

/// Role of a member as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Replica,
    Unknown,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    pub address: String,
    pub role: Role,
    /// Last successful heartbeat; `None` until the first one.
    pub last_heartbeat: Option<Instant>,
    pub lease_term: u64,
    /// Last WAL segment the member reported as replayed.
    pub wal_acked: Option<u64>,
    pub timeline: u32,
    /// The member reported it could stand for election.
    pub electable: bool,
    /// Database system identifier the member last reported.
    pub system_id: Option<u64>,
    /// Configured members always count towards the quorum size.
    pub configured: bool,
}

impl Member {
    fn new(id: &str, address: &str, configured: bool) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            role: Role::Unknown,
            last_heartbeat: None,
            lease_term: 0,
            wal_acked: None,
            timeline: 1,
            electable: false,
            system_id: None,
            configured,
        }
    }

    /// Whether the last heartbeat is younger than `ttl`.
    pub fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        self.last_heartbeat
            .is_some_and(|seen| now.saturating_duration_since(seen) <= ttl)
    }
}

/// Serializable view of a member, served by the API and gossiped between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberView {
    pub id: String,
    pub address: String,
    pub role: Role,
    pub lease_term: u64,
    pub wal_acked: Option<u64>,
    pub timeline: u32,
    /// Milliseconds since the last heartbeat, `None` if never seen.
    pub heartbeat_age_ms: Option<u64>,
}

/// Membership as known by one member.
#[derive(Debug, Clone)]
pub struct MembershipRegistry {
    self_id: String,
    members: BTreeMap<String, Member>,
    configured_size: usize,
}

impl MembershipRegistry {
    /// Create a registry holding this member and its configured peers.
    pub fn new(self_id: &str, self_address: &str, peers: &[PeerConfig]) -> Self {
        let mut members = BTreeMap::new();
        let mut own = Member::new(self_id, self_address, true);
        own.last_heartbeat = Some(Instant::now());
        members.insert(self_id.to_string(), own);
        for peer in peers {
            members.insert(peer.id.clone(), Member::new(&peer.id, &peer.address, true));
        }
        Self {
            self_id: self_id.to_string(),
            configured_size: peers.len() + 1,
            members,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn get(&self, id: &str) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Add a member discovered at runtime. Joining twice updates the address.
    pub fn join(&mut self, id: &str, address: &str) {
        match self.members.get_mut(id) {
            Some(member) => member.address = address.to_string(),
            None => {
                info!(member = %id, address = %address, "Member joined");
                self.members.insert(id.to_string(), Member::new(id, address, false));
            }
        }
    }

    /// Remove a member after a graceful leave.
    pub fn leave(&mut self, id: &str) -> Option<Member> {
        if id == self.self_id {
            return None;
        }
        let removed = self.members.remove(id);
        if let Some(member) = &removed {
            info!(member = %id, role = %member.role, "Member left");
            if member.configured {
                self.configured_size = self.configured_size.saturating_sub(1).max(1);
            }
        }
        removed
    }

    /// Record a successful heartbeat carrying the peer's own status.
    pub fn heartbeat(&mut self, status: &MemberStatus, now: Instant) -> Result<()> {
        let member = self
            .members
            .get_mut(&status.id)
            .ok_or_else(|| Error::UnknownMember(status.id.clone()))?;
        member.last_heartbeat = Some(now);
        member.lease_term = member.lease_term.max(status.lease_term);
        member.wal_acked = status.wal_position.or(member.wal_acked);
        member.timeline = status.timeline;
        member.electable = status.electable;
        member.system_id = status.system_id.or(member.system_id);
        let mut role = status.role;
        // A primary claim from an older term than the known primary is stale
        if role == Role::Primary
            && self
                .primary()
                .is_some_and(|p| p.id != status.id && p.lease_term > status.lease_term)
        {
            role = Role::Unknown;
        }
        self.update_role(&status.id, role)
    }

    /// Mark this member itself as alive.
    pub fn touch_self(&mut self, now: Instant) {
        if let Some(own) = self.members.get_mut(&self.self_id) {
            own.last_heartbeat = Some(now);
        }
    }

    /// Set a member's role. Recording a primary demotes any other primary.
    pub fn update_role(&mut self, id: &str, role: Role) -> Result<()> {
        if !self.members.contains_key(id) {
            return Err(Error::UnknownMember(id.to_string()));
        }
        if role == Role::Primary {
            for other in self.members.values_mut().filter(|m| m.id != id) {
                if other.role == Role::Primary {
                    debug!(member = %other.id, new_primary = %id, "Demoting stale primary in registry");
                    other.role = Role::Unknown;
                }
            }
        }
        if let Some(member) = self.members.get_mut(id) {
            member.role = role;
        }
        Ok(())
    }

    /// Record the lease term a member is known to hold.
    pub fn update_term(&mut self, id: &str, term: u64) -> Result<()> {
        let member = self
            .members
            .get_mut(id)
            .ok_or_else(|| Error::UnknownMember(id.to_string()))?;
        member.lease_term = member.lease_term.max(term);
        Ok(())
    }

    /// Serializable view of all members, ordered by id.
    pub fn snapshot(&self, now: Instant) -> Vec<MemberView> {
        self.members
            .values()
            .map(|m| MemberView {
                id: m.id.clone(),
                address: m.address.clone(),
                role: m.role,
                lease_term: m.lease_term,
                wal_acked: m.wal_acked,
                timeline: m.timeline,
                heartbeat_age_ms: m
                    .last_heartbeat
                    .map(|seen| now.saturating_duration_since(seen).as_millis() as u64),
            })
            .collect()
    }

    /// Newest WAL position among fresh peers that could stand for election.
    pub fn freshest_electable_position(&self, now: Instant, ttl: Duration) -> Option<u64> {
        self.members
            .values()
            .filter(|m| m.id != self.self_id && m.electable && m.is_fresh(now, ttl))
            .filter_map(|m| m.wal_acked)
            .max()
    }

    /// Current primary, if any.
    pub fn primary(&self) -> Option<&Member> {
        self.members.values().find(|m| m.role == Role::Primary)
    }

    /// System identifier of the data the current primary serves.
    pub fn cluster_system_id(&self) -> Option<u64> {
        self.primary()
            .filter(|p| p.id != self.self_id)
            .and_then(|p| p.system_id)
    }

    /// Whether this member can see a strict majority of the cluster.
    ///
    /// This member always counts itself; peers count when their heartbeat
    /// is younger than `member_ttl`.
    pub fn is_quorum_reachable(&self, now: Instant, member_ttl: Duration) -> bool {
        let reachable = 1 + self
            .members
            .values()
            .filter(|m| m.id != self.self_id && m.is_fresh(now, member_ttl))
            .count();
        let size = self.configured_size.max(self.members.len());
        reachable * 2 > size
    }

    /// Drop dynamic members whose heartbeat is older than `ttl` and reset
    /// the role of stale configured members. Returns the removed ids.
    pub fn expire(&mut self, now: Instant, ttl: Duration) -> Vec<String> {
        let self_id = self.self_id.clone();
        let stale: Vec<String> = self
            .members
            .values()
            .filter(|m| m.id != self_id && !m.is_fresh(now, ttl))
            .map(|m| m.id.clone())
            .collect();
        let mut removed = Vec::new();
        for id in stale {
            let configured = self.members.get(&id).is_some_and(|m| m.configured);
            if configured {
                if let Some(member) = self.members.get_mut(&id) {
                    member.role = Role::Unknown;
                    member.electable = false;
                }
            } else {
                debug!(member = %id, "Expiring member without heartbeat");
                self.members.remove(&id);
                removed.push(id);
            }
        }
        removed
    }

    /// Reconcile with a peer's view: newer lease terms win.
    ///
    /// Members unknown locally are only admitted when the peer heard from
    /// them within `ttl`, so gossip does not resurrect expired members.
    pub fn merge(&mut self, remote: &[MemberView], ttl: Duration) {
        let mut promotions = Vec::new();
        for view in remote {
            if view.id == self.self_id {
                continue;
            }
            let Some(local) = self.members.get_mut(&view.id) else {
                let fresh = view
                    .heartbeat_age_ms
                    .is_some_and(|age| u128::from(age) <= ttl.as_millis());
                if !fresh {
                    continue;
                }
                self.join(&view.id, &view.address);
                if let Some(joined) = self.members.get_mut(&view.id) {
                    joined.lease_term = view.lease_term;
                    joined.timeline = view.timeline;
                    if view.role == Role::Primary {
                        promotions.push(view.id.clone());
                    } else {
                        joined.role = view.role;
                    }
                }
                continue;
            };
            if view.lease_term > local.lease_term {
                local.lease_term = view.lease_term;
                local.timeline = view.timeline;
                if view.role == Role::Primary {
                    promotions.push(view.id.clone());
                } else {
                    local.role = view.role;
                }
            }
        }
        for id in promotions {
            // Only the highest term may hold the primary role
            let term = self.members.get(&id).map(|m| m.lease_term).unwrap_or(0);
            let current = self.primary().map(|p| (p.id.clone(), p.lease_term));
            if current.is_none_or(|(pid, pterm)| pid == id || term > pterm) {
                if let Err(e) = self.update_role(&id, Role::Primary) {
                    warn!(member = %id, error = %e, "Failed to record gossiped primary");
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::controller::state_machine::MemberState;

    fn peers(ids: &[&str]) -> Vec<PeerConfig> {
        ids.iter()
            .map(|id| PeerConfig {
                id: id.to_string(),
                address: format!("{}:8008", id),
            })
            .collect()
    }

    fn status(id: &str, role: Role, term: u64) -> MemberStatus {
        MemberStatus {
            id: id.to_string(),
            address: format!("{}:8008", id),
            role,
            state: MemberState::Replica,
            lease_term: term,
            timeline: 1,
            wal_position: Some(3),
            writes_open: false,
            blocked: false,
            electable: true,
            system_id: Some(7),
            members: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_primary_invariant() {
        let mut registry = MembershipRegistry::new("pg-0", "pg-0:8008", &peers(&["pg-1", "pg-2"]));
        registry.update_role("pg-1", Role::Primary).unwrap();
        registry.update_role("pg-2", Role::Primary).unwrap();
        let primaries: Vec<_> = registry
            .snapshot(Instant::now())
            .into_iter()
            .filter(|m| m.role == Role::Primary)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].id, "pg-2");
        assert_eq!(registry.get("pg-1").unwrap().role, Role::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_member_is_rejected() {
        let mut registry = MembershipRegistry::new("pg-0", "pg-0:8008", &[]);
        assert!(matches!(
            registry.update_role("pg-9", Role::Replica),
            Err(Error::UnknownMember(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_member_loses_quorum() {
        let ttl = Duration::from_secs(30);
        let mut registry = MembershipRegistry::new("pg-0", "pg-0:8008", &peers(&["pg-1", "pg-2"]));
        assert!(!registry.is_quorum_reachable(Instant::now(), ttl));

        registry.heartbeat(&status("pg-1", Role::Replica, 0), Instant::now()).unwrap();
        assert!(registry.is_quorum_reachable(Instant::now(), ttl));

        tokio::time::advance(ttl + Duration::from_secs(1)).await;
        assert!(!registry.is_quorum_reachable(Instant::now(), ttl));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_member_cluster_has_quorum() {
        let registry = MembershipRegistry::new("pg-0", "pg-0:8008", &[]);
        assert!(registry.is_quorum_reachable(Instant::now(), Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_drops_dynamic_members_only() {
        let ttl = Duration::from_secs(30);
        let mut registry = MembershipRegistry::new("pg-0", "pg-0:8008", &peers(&["pg-1"]));
        registry.join("pg-5", "pg-5:8008");
        registry.update_role("pg-1", Role::Replica).unwrap();
        tokio::time::advance(ttl * 2).await;

        let removed = registry.expire(Instant::now(), ttl);
        assert_eq!(removed, vec!["pg-5".to_string()]);
        assert_eq!(registry.get("pg-1").unwrap().role, Role::Unknown);
        assert!(registry.get("pg-0").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_prefers_newer_term() {
        let mut registry = MembershipRegistry::new("pg-0", "pg-0:8008", &peers(&["pg-1", "pg-2"]));
        registry.update_role("pg-1", Role::Primary).unwrap();
        registry.update_term("pg-1", 3).unwrap();

        let now = Instant::now();
        let mut remote = registry.snapshot(now);
        for view in &mut remote {
            if view.id == "pg-2" {
                view.role = Role::Primary;
                view.lease_term = 4;
            }
        }
        registry.merge(&remote, Duration::from_secs(30));
        assert_eq!(registry.primary().unwrap().id, "pg-2");

        // A stale view does not bring the old primary back
        let mut stale = remote.clone();
        for view in &mut stale {
            if view.id == "pg-1" {
                view.role = Role::Primary;
            }
        }
        registry.merge(&stale, Duration::from_secs(30));
        assert_eq!(registry.primary().unwrap().id, "pg-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_system_id_follows_primary() {
        let mut registry = MembershipRegistry::new("pg-0", "pg-0:8008", &peers(&["pg-1", "pg-2"]));
        let now = Instant::now();
        assert_eq!(registry.cluster_system_id(), None);

        registry.heartbeat(&status("pg-2", Role::Replica, 1), now).unwrap();
        assert_eq!(registry.cluster_system_id(), None);

        registry.heartbeat(&status("pg-1", Role::Primary, 1), now).unwrap();
        assert_eq!(registry.cluster_system_id(), Some(7));

        // A heartbeat without an identifier keeps the last one seen
        let mut restarted = status("pg-1", Role::Primary, 1);
        restarted.system_id = None;
        registry.heartbeat(&restarted, now).unwrap();
        assert_eq!(registry.cluster_system_id(), Some(7));

        // Our own record never counts as the reference
        registry.update_role("pg-0", Role::Primary).unwrap();
        assert_eq!(registry.cluster_system_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_skips_expired_members() {
        let ttl = Duration::from_secs(30);
        let mut registry = MembershipRegistry::new("pg-0", "pg-0:8008", &peers(&["pg-1"]));
        registry.join("pg-5", "pg-5:8008");
        tokio::time::advance(ttl * 2).await;
        assert_eq!(registry.expire(Instant::now(), ttl), vec!["pg-5".to_string()]);

        // pg-1 still lists pg-5, last heard from long ago
        let gossip = |age: Option<u64>| MemberView {
            id: "pg-5".to_string(),
            address: "pg-5:8008".to_string(),
            role: Role::Replica,
            lease_term: 0,
            wal_acked: None,
            timeline: 1,
            heartbeat_age_ms: age,
        };
        registry.merge(&[gossip(Some(60_000))], ttl);
        registry.merge(&[gossip(None)], ttl);
        assert!(registry.get("pg-5").is_none());

        registry.merge(&[gossip(Some(5_000))], ttl);
        assert!(registry.get("pg-5").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_freshest_electable_position() {
        let ttl = Duration::from_secs(30);
        let mut registry = MembershipRegistry::new("pg-0", "pg-0:8008", &peers(&["pg-1", "pg-2"]));
        assert_eq!(registry.freshest_electable_position(Instant::now(), ttl), None);

        let mut ahead = status("pg-1", Role::Replica, 1);
        ahead.wal_position = Some(7);
        registry.heartbeat(&ahead, Instant::now()).unwrap();
        registry.heartbeat(&status("pg-2", Role::Replica, 1), Instant::now()).unwrap();
        assert_eq!(registry.freshest_electable_position(Instant::now(), ttl), Some(7));

        // A peer whose database is down does not count
        ahead.electable = false;
        registry.heartbeat(&ahead, Instant::now()).unwrap();
        assert_eq!(registry.freshest_electable_position(Instant::now(), ttl), Some(3));

        tokio::time::advance(ttl * 2).await;
        assert_eq!(registry.freshest_electable_position(Instant::now(), ttl), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_records_wal_position() {
        let mut registry = MembershipRegistry::new("pg-0", "pg-0:8008", &peers(&["pg-1"]));
        registry.heartbeat(&status("pg-1", Role::Replica, 2), Instant::now()).unwrap();
        let member = registry.get("pg-1").unwrap();
        assert_eq!(member.wal_acked, Some(3));
        assert_eq!(member.lease_term, 2);
        assert_eq!(member.role, Role::Replica);
    }
}
