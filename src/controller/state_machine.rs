//! Finite state machine for a member's role in the failover protocol.
//!
//! Transitions are listed in one table with optional guards, so the set of
//! legal role changes can be read (and tested) in one place:
//!
//! `Unknown → Replica → Candidate → Primary → Replica`, and any state goes
//! to `Unknown` when the consensus backend becomes unreachable.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::Role;

/// Role state of the local member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    /// Backend unreachable or not yet evaluated; never serves writes.
    Unknown,
    Replica,
    /// Trying to acquire the lease.
    Candidate,
    Primary,
}

impl MemberState {
    /// Role published in the membership registry.
    pub fn role(&self) -> Role {
        match self {
            MemberState::Primary => Role::Primary,
            MemberState::Replica | MemberState::Candidate => Role::Replica,
            MemberState::Unknown => Role::Unknown,
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberState::Unknown => write!(f, "Unknown"),
            MemberState::Replica => write!(f, "Replica"),
            MemberState::Candidate => write!(f, "Candidate"),
            MemberState::Primary => write!(f, "Primary"),
        }
    }
}

/// Events that trigger role transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberEvent {
    /// Primary silent past the detection window, or lease expired/absent
    LeaderLost,
    /// `acquire()` succeeded
    LeaseAcquired,
    /// `acquire()` lost to another holder
    LeaseHeld,
    /// `renew()` failed or the local lease deadline passed
    LeaseExpired,
    /// A backend call failed or exceeded its deadline
    BackendUnreachable,
    /// The backend answered again
    BackendReachable,
    /// Candidate did not win within the candidate timeout
    CandidateTimeout,
    /// This member cannot see a majority of the cluster
    QuorumLost,
    /// Local database process missing or frozen
    DatabaseDown,
}

impl fmt::Display for MemberEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberEvent::LeaderLost => write!(f, "LeaderLost"),
            MemberEvent::LeaseAcquired => write!(f, "LeaseAcquired"),
            MemberEvent::LeaseHeld => write!(f, "LeaseHeld"),
            MemberEvent::LeaseExpired => write!(f, "LeaseExpired"),
            MemberEvent::BackendUnreachable => write!(f, "BackendUnreachable"),
            MemberEvent::BackendReachable => write!(f, "BackendReachable"),
            MemberEvent::CandidateTimeout => write!(f, "CandidateTimeout"),
            MemberEvent::QuorumLost => write!(f, "QuorumLost"),
            MemberEvent::DatabaseDown => write!(f, "DatabaseDown"),
        }
    }
}

/// Context information available to guards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionContext {
    /// A strict majority of members is reachable
    pub quorum_reachable: bool,
    /// A DataGap blocked automatic promotion
    pub blocked: bool,
    /// Local database process is running
    pub database_running: bool,
    /// Local data directory holds a cluster
    pub data_present: bool,
    /// Election backoff has elapsed
    pub backoff_elapsed: bool,
    /// Newest WAL segment replayed locally
    pub wal_position: Option<u64>,
    /// Newest WAL segment held by a fresh peer that could stand for election
    pub peer_wal_position: Option<u64>,
}

impl TransitionContext {
    /// A reachable electable peer has replayed WAL this member has not.
    pub fn behind_peer(&self) -> bool {
        self.peer_wal_position > self.wal_position
    }
}

impl Default for TransitionContext {
    fn default() -> Self {
        Self {
            quorum_reachable: true,
            blocked: false,
            database_running: true,
            data_present: true,
            backoff_elapsed: true,
            wal_position: None,
            peer_wal_position: None,
        }
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: MemberState,
    pub to: MemberState,
    pub event: MemberEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: MemberState,
        to: MemberState,
        event: MemberEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    Success {
        from: MemberState,
        to: MemberState,
        event: MemberEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: MemberState,
        event: MemberEvent,
    },
    GuardFailed {
        from: MemberState,
        to: MemberState,
        event: MemberEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Target state when the transition applies.
    pub fn target(&self) -> Option<MemberState> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Role state machine
pub struct MemberStateMachine {
    transitions: Vec<Transition>,
}

impl Default for MemberStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemberStateMachine {
    pub fn new() -> Self {
        use MemberEvent as E;
        use MemberState as S;
        Self {
            transitions: vec![
                // === Unknown ===
                Transition::new(S::Unknown, S::Replica, E::BackendReachable, "Backend reachable again, re-evaluating as replica"),
                // === Replica ===
                Transition::new(S::Replica, S::Candidate, E::LeaderLost, "Primary lost, standing for election"),
                Transition::new(S::Replica, S::Unknown, E::BackendUnreachable, "Backend unreachable"),
                // === Candidate ===
                Transition::new(S::Candidate, S::Primary, E::LeaseAcquired, "Won the election"),
                Transition::new(S::Candidate, S::Replica, E::LeaseHeld, "Lost the election race"),
                Transition::new(S::Candidate, S::Replica, E::CandidateTimeout, "Election did not finish in time"),
                Transition::new(S::Candidate, S::Replica, E::QuorumLost, "Lost quorum during election"),
                Transition::new(S::Candidate, S::Unknown, E::BackendUnreachable, "Backend unreachable during election"),
                // === Primary ===
                Transition::new(S::Primary, S::Replica, E::LeaseExpired, "Lease lost, demoting"),
                Transition::new(S::Primary, S::Replica, E::QuorumLost, "Isolated from the majority, demoting"),
                Transition::new(S::Primary, S::Replica, E::DatabaseDown, "Local database down, stepping down"),
                Transition::new(S::Primary, S::Unknown, E::BackendUnreachable, "Backend unreachable while primary"),
            ],
        }
    }

    /// Attempt a transition for `event` from `current`.
    pub fn transition(
        &self,
        current: &MemberState,
        event: MemberEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event);

        match transition {
            Some(t) => {
                if let Some(reason) = self.check_guard(t, ctx) {
                    TransitionResult::GuardFailed {
                        from: t.from,
                        to: t.to,
                        event,
                        reason,
                    }
                } else {
                    TransitionResult::Success {
                        from: t.from,
                        to: t.to,
                        event,
                        description: t.description,
                    }
                }
            }
            None => TransitionResult::InvalidTransition {
                current: *current,
                event,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &MemberState, event: &MemberEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// All events with a transition out of `state`
    pub fn valid_events(&self, state: &MemberState) -> Vec<&MemberEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (&transition.from, &transition.to) {
            // Candidacy requires quorum, an unblocked member and a usable database
            (MemberState::Replica, MemberState::Candidate) => {
                if !ctx.quorum_reachable {
                    Some("quorum not reachable".to_string())
                } else if ctx.blocked {
                    Some("blocked: manual intervention required".to_string())
                } else if !ctx.database_running {
                    Some("local database not running".to_string())
                } else if !ctx.data_present {
                    Some("local data directory is empty".to_string())
                } else if ctx.behind_peer() {
                    Some(format!(
                        "peer holds newer WAL ({:?} > {:?})",
                        ctx.peer_wal_position, ctx.wal_position
                    ))
                } else if !ctx.backoff_elapsed {
                    Some("election backoff not elapsed".to_string())
                } else {
                    None
                }
            }
            // Re-check quorum and freshness at the moment of winning
            (MemberState::Candidate, MemberState::Primary) => {
                if !ctx.quorum_reachable {
                    Some("quorum lost before promotion".to_string())
                } else if ctx.blocked {
                    Some("blocked: manual intervention required".to_string())
                } else if ctx.behind_peer() {
                    Some("peer holds newer WAL".to_string())
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// What the control loop observed about the lease this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseObservation {
    /// The backend could not be reached
    Unreachable,
    /// No lease, or the lease expired
    Vacant,
    HeldBySelf,
    HeldByOther { holder: String },
}

/// Inputs for [`determine_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub lease: LeaseObservation,
    /// How long the primary has been unreachable over the peer channel
    pub primary_silent_for: Duration,
    pub detection_window: Duration,
    /// Time spent in the Candidate state
    pub candidate_for: Duration,
    pub candidate_timeout: Duration,
    pub quorum_reachable: bool,
    pub database_running: bool,
}

/// Determine the event implied by an observation, before any action runs.
///
/// Returns `None` when the current state should be kept.
pub fn determine_event(state: &MemberState, obs: &Observation) -> Option<MemberEvent> {
    if obs.lease == LeaseObservation::Unreachable {
        return (*state != MemberState::Unknown).then_some(MemberEvent::BackendUnreachable);
    }

    match state {
        MemberState::Unknown => Some(MemberEvent::BackendReachable),
        MemberState::Replica => {
            let leader_lost = match &obs.lease {
                LeaseObservation::Vacant => true,
                LeaseObservation::HeldByOther { .. } => obs.primary_silent_for > obs.detection_window,
                // A replica that still holds the lease (e.g. after a restart) re-takes it
                LeaseObservation::HeldBySelf => true,
                LeaseObservation::Unreachable => false,
            };
            leader_lost.then_some(MemberEvent::LeaderLost)
        }
        MemberState::Candidate => {
            if !obs.quorum_reachable {
                Some(MemberEvent::QuorumLost)
            } else if obs.candidate_for > obs.candidate_timeout {
                Some(MemberEvent::CandidateTimeout)
            } else {
                None
            }
        }
        MemberState::Primary => {
            if !matches!(obs.lease, LeaseObservation::HeldBySelf) {
                Some(MemberEvent::LeaseExpired)
            } else if !obs.quorum_reachable {
                Some(MemberEvent::QuorumLost)
            } else if !obs.database_running {
                Some(MemberEvent::DatabaseDown)
            } else {
                None
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

    fn observation(lease: LeaseObservation) -> Observation {
        Observation {
            lease,
            primary_silent_for: Duration::ZERO,
            detection_window: Duration::from_secs(20),
            candidate_for: Duration::ZERO,
            candidate_timeout: Duration::from_secs(30),
            quorum_reachable: true,
            database_running: true,
        }
    }

    #[test]
    fn test_replica_to_candidate() {
        let sm = MemberStateMachine::new();
        let result = sm.transition(&MemberState::Replica, MemberEvent::LeaderLost, &TransitionContext::default());
        assert_eq!(result.target(), Some(MemberState::Candidate));
    }

    #[test]
    fn test_candidacy_guard_requires_quorum() {
        let sm = MemberStateMachine::new();
        let ctx = TransitionContext {
            quorum_reachable: false,
            ..Default::default()
        };
        match sm.transition(&MemberState::Replica, MemberEvent::LeaderLost, &ctx) {
            TransitionResult::GuardFailed { reason, .. } => assert!(reason.contains("quorum")),
            other => panic!("expected guard failure, got {:?}", other),
        }
    }

    #[test]
    fn test_blocked_member_never_becomes_candidate() {
        let sm = MemberStateMachine::new();
        let ctx = TransitionContext {
            blocked: true,
            ..Default::default()
        };
        assert!(matches!(
            sm.transition(&MemberState::Replica, MemberEvent::LeaderLost, &ctx),
            TransitionResult::GuardFailed { .. }
        ));
    }

    #[test]
    fn test_lagging_replica_yields_to_fresher_peer() {
        let sm = MemberStateMachine::new();
        let behind = TransitionContext {
            wal_position: Some(2),
            peer_wal_position: Some(5),
            ..Default::default()
        };
        match sm.transition(&MemberState::Replica, MemberEvent::LeaderLost, &behind) {
            TransitionResult::GuardFailed { reason, .. } => assert!(reason.contains("newer WAL")),
            other => panic!("expected guard failure, got {:?}", other),
        }
        assert!(matches!(
            sm.transition(&MemberState::Candidate, MemberEvent::LeaseAcquired, &behind),
            TransitionResult::GuardFailed { .. }
        ));

        // Equal positions, or no electable peer at all, do not hold a member back
        for peer_wal_position in [Some(5), None] {
            let ctx = TransitionContext {
                wal_position: Some(5),
                peer_wal_position,
                ..Default::default()
            };
            assert_eq!(
                sm.transition(&MemberState::Replica, MemberEvent::LeaderLost, &ctx).target(),
                Some(MemberState::Candidate)
            );
        }
    }

    #[test]
    fn test_any_state_goes_unknown_on_backend_loss() {
        let sm = MemberStateMachine::new();
        for state in [MemberState::Replica, MemberState::Candidate, MemberState::Primary] {
            let result = sm.transition(&state, MemberEvent::BackendUnreachable, &TransitionContext::default());
            assert_eq!(result.target(), Some(MemberState::Unknown), "from {}", state);
        }
    }

    #[test]
    fn test_replica_cannot_jump_to_primary() {
        let sm = MemberStateMachine::new();
        assert!(matches!(
            sm.transition(&MemberState::Replica, MemberEvent::LeaseAcquired, &TransitionContext::default()),
            TransitionResult::InvalidTransition { .. }
        ));
        assert!(!sm.can_transition(&MemberState::Unknown, &MemberEvent::LeaseAcquired));
    }

    #[test]
    fn test_primary_exits_lead_to_replica() {
        let sm = MemberStateMachine::new();
        let events = sm.valid_events(&MemberState::Primary);
        assert_eq!(events.len(), 4);
        for event in [MemberEvent::LeaseExpired, MemberEvent::QuorumLost, MemberEvent::DatabaseDown] {
            let result = sm.transition(&MemberState::Primary, event, &TransitionContext::default());
            assert_eq!(result.target(), Some(MemberState::Replica));
        }
    }

    #[test]
    fn test_determine_event_backend_priority() {
        let obs = observation(LeaseObservation::Unreachable);
        assert_eq!(
            determine_event(&MemberState::Primary, &obs),
            Some(MemberEvent::BackendUnreachable)
        );
        assert_eq!(determine_event(&MemberState::Unknown, &obs), None);
    }

    #[test]
    fn test_determine_event_replica_waits_for_detection_window() {
        let mut obs = observation(LeaseObservation::HeldByOther {
            holder: "pg-1".into(),
        });
        obs.primary_silent_for = Duration::from_secs(10);
        assert_eq!(determine_event(&MemberState::Replica, &obs), None);

        obs.primary_silent_for = Duration::from_secs(21);
        assert_eq!(
            determine_event(&MemberState::Replica, &obs),
            Some(MemberEvent::LeaderLost)
        );

        let vacant = observation(LeaseObservation::Vacant);
        assert_eq!(
            determine_event(&MemberState::Replica, &vacant),
            Some(MemberEvent::LeaderLost)
        );
    }

    #[test]
    fn test_determine_event_primary_checks() {
        let mut obs = observation(LeaseObservation::HeldBySelf);
        assert_eq!(determine_event(&MemberState::Primary, &obs), None);

        obs.quorum_reachable = false;
        assert_eq!(
            determine_event(&MemberState::Primary, &obs),
            Some(MemberEvent::QuorumLost)
        );

        let lost = observation(LeaseObservation::HeldByOther {
            holder: "pg-2".into(),
        });
        assert_eq!(
            determine_event(&MemberState::Primary, &lost),
            Some(MemberEvent::LeaseExpired)
        );
    }

    #[test]
    fn test_determine_event_candidate_timeout() {
        let mut obs = observation(LeaseObservation::Vacant);
        obs.candidate_for = Duration::from_secs(31);
        assert_eq!(
            determine_event(&MemberState::Candidate, &obs),
            Some(MemberEvent::CandidateTimeout)
        );
    }

    #[test]
    fn test_role_mapping() {
        assert_eq!(MemberState::Candidate.role(), Role::Replica);
        assert_eq!(MemberState::Unknown.role(), Role::Unknown);
    }
}
