// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for pg-ha-supervisor.
//!
//! Uses proptest to generate random inputs and verify invariants.

use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;

use pg_ha_supervisor::config::{DynamicSettings, MAX_TIMING_SECS, PeerConfig};
use pg_ha_supervisor::controller::{Error, MemberStatus};
use pg_ha_supervisor::controller::state_machine::{
    LeaseObservation, MemberEvent, MemberState, MemberStateMachine, Observation,
    TransitionContext, TransitionResult, determine_event,
};
use pg_ha_supervisor::registry::{MembershipRegistry, Role};
use pg_ha_supervisor::wal::{WalFileName, WalManager};

/// Strategy for generating member states.
fn any_state() -> impl Strategy<Value = MemberState> {
    prop_oneof![
        Just(MemberState::Unknown),
        Just(MemberState::Replica),
        Just(MemberState::Candidate),
        Just(MemberState::Primary),
    ]
}

/// Strategy for generating events.
fn any_event() -> impl Strategy<Value = MemberEvent> {
    prop_oneof![
        Just(MemberEvent::LeaderLost),
        Just(MemberEvent::LeaseAcquired),
        Just(MemberEvent::LeaseHeld),
        Just(MemberEvent::LeaseExpired),
        Just(MemberEvent::BackendUnreachable),
        Just(MemberEvent::BackendReachable),
        Just(MemberEvent::CandidateTimeout),
        Just(MemberEvent::QuorumLost),
        Just(MemberEvent::DatabaseDown),
    ]
}

fn any_context() -> impl Strategy<Value = TransitionContext> {
    (
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        proptest::option::of(0..10u64),
        proptest::option::of(0..10u64),
    )
        .prop_map(
            |(
                quorum_reachable,
                blocked,
                database_running,
                data_present,
                backoff_elapsed,
                wal_position,
                peer_wal_position,
            )| TransitionContext {
                quorum_reachable,
                blocked,
                database_running,
                data_present,
                backoff_elapsed,
                wal_position,
                peer_wal_position,
            },
        )
}

fn any_lease() -> impl Strategy<Value = LeaseObservation> {
    prop_oneof![
        Just(LeaseObservation::Unreachable),
        Just(LeaseObservation::Vacant),
        Just(LeaseObservation::HeldBySelf),
        Just(LeaseObservation::HeldByOther {
            holder: "pg-1".to_string()
        }),
    ]
}

fn any_observation() -> impl Strategy<Value = Observation> {
    (any_lease(), 0..120u64, 0..120u64, any::<bool>(), any::<bool>()).prop_map(
        |(lease, silent, candidate_for, quorum_reachable, database_running)| Observation {
            lease,
            primary_silent_for: Duration::from_secs(silent),
            detection_window: Duration::from_secs(20),
            candidate_for: Duration::from_secs(candidate_for),
            candidate_timeout: Duration::from_secs(30),
            quorum_reachable,
            database_running,
        },
    )
}

proptest! {
    /// Property: transitions are deterministic.
    #[test]
    fn test_transitions_deterministic(
        state in any_state(),
        event in any_event(),
        ctx in any_context()
    ) {
        let sm = MemberStateMachine::new();
        prop_assert_eq!(sm.transition(&state, event, &ctx), sm.transition(&state, event, &ctx));
    }

    /// Property: the only way into Primary is winning the lease as a
    /// candidate with quorum and no block.
    #[test]
    fn test_primary_only_through_lease(
        state in any_state(),
        event in any_event(),
        ctx in any_context()
    ) {
        let sm = MemberStateMachine::new();
        if let TransitionResult::Success { from, to: MemberState::Primary, .. } = sm.transition(&state, event, &ctx) {
            prop_assert_eq!(from, MemberState::Candidate);
            prop_assert_eq!(event, MemberEvent::LeaseAcquired);
            prop_assert!(ctx.quorum_reachable);
            prop_assert!(!ctx.blocked);
            prop_assert!(ctx.peer_wal_position <= ctx.wal_position);
        }
    }

    /// Property: candidacy needs quorum, a usable database, no block and
    /// no electable peer holding newer WAL.
    #[test]
    fn test_candidacy_guards(ctx in any_context()) {
        let sm = MemberStateMachine::new();
        let result = sm.transition(&MemberState::Replica, MemberEvent::LeaderLost, &ctx);
        let allowed = ctx.quorum_reachable
            && !ctx.blocked
            && ctx.database_running
            && ctx.data_present
            && ctx.peer_wal_position <= ctx.wal_position
            && ctx.backoff_elapsed;
        prop_assert_eq!(result.target() == Some(MemberState::Candidate), allowed);
    }

    /// Property: Primary leaves on every failure event, whatever the guards say.
    #[test]
    fn test_primary_always_steps_down(ctx in any_context()) {
        let sm = MemberStateMachine::new();
        for event in [
            MemberEvent::LeaseExpired,
            MemberEvent::QuorumLost,
            MemberEvent::DatabaseDown,
            MemberEvent::BackendUnreachable,
        ] {
            let target = sm.transition(&MemberState::Primary, event, &ctx).target();
            prop_assert!(target.is_some(), "Primary stuck on {:?}", event);
            prop_assert_ne!(target, Some(MemberState::Primary));
        }
    }

    /// Property: a primary without its lease always sees LeaseExpired, and
    /// an unreachable backend always moves a member to Unknown.
    #[test]
    fn test_determine_event_lease_first(state in any_state(), obs in any_observation()) {
        let event = determine_event(&state, &obs);
        if obs.lease == LeaseObservation::Unreachable {
            if state == MemberState::Unknown {
                prop_assert_eq!(event, None);
            } else {
                prop_assert_eq!(event, Some(MemberEvent::BackendUnreachable));
            }
        } else if state == MemberState::Primary && obs.lease != LeaseObservation::HeldBySelf {
            prop_assert_eq!(event, Some(MemberEvent::LeaseExpired));
        }
        if let Some(event) = event {
            let sm = MemberStateMachine::new();
            prop_assert!(sm.can_transition(&state, &event), "{:?} has no transition on {:?}", state, event);
        }
    }

    /// Property: settings validation matches the timing rules.
    #[test]
    fn test_settings_validation(
        loop_wait in 0..60u64,
        ttl in 0..200u64,
        retry_timeout in 0..200u64,
        wal_keep_segments in any::<u64>()
    ) {
        let settings = DynamicSettings { loop_wait, ttl, retry_timeout, wal_keep_segments };
        let expected = loop_wait > 0
            && ttl >= loop_wait * 2
            && retry_timeout > 0
            && retry_timeout < ttl;
        prop_assert_eq!(settings.validate().is_ok(), expected);
    }

    /// Property: out-of-range timings are rejected without panicking, and
    /// accepted settings keep their derived windows representable.
    #[test]
    fn test_settings_validation_extremes(
        loop_wait in prop_oneof![Just(u64::MAX), Just(u64::MAX / 2 + 1), 0..=MAX_TIMING_SECS + 1],
        ttl in prop_oneof![Just(u64::MAX), 0..=MAX_TIMING_SECS + 1],
        retry_timeout in prop_oneof![Just(u64::MAX), 0..=MAX_TIMING_SECS + 1]
    ) {
        let settings = DynamicSettings { loop_wait, ttl, retry_timeout, ..Default::default() };
        let in_range = loop_wait <= MAX_TIMING_SECS
            && ttl <= MAX_TIMING_SECS
            && retry_timeout <= MAX_TIMING_SECS;
        match settings.validate() {
            Ok(()) => {
                prop_assert!(in_range);
                let now = Instant::now();
                prop_assert!(now.checked_add(settings.ttl()).is_some());
                prop_assert!(now.checked_add(settings.liveness_window()).is_some());
                prop_assert!(now.checked_add(settings.detection_window()).is_some());
            }
            Err(e) => prop_assert!(matches!(e, Error::Validation(_))),
        }
    }

    /// Property: WAL file names parse back to what they were printed from.
    #[test]
    fn test_wal_file_name_roundtrip(timeline in 1..u32::MAX, segment in 0..(u64::from(u32::MAX) * 0x100)) {
        let name = WalFileName { timeline, segment };
        let printed = name.to_string();
        prop_assert_eq!(printed.len(), 24);
        prop_assert_eq!(printed.parse::<WalFileName>().unwrap(), name);
    }
}

// =============================================================================
// WAL retention
// =============================================================================

#[derive(Debug, Clone)]
enum WalOp {
    Append,
    Rotate,
    /// Member acknowledges `lag` segments behind the current one.
    Ack { member: usize, lag: u64 },
    Forget { member: usize },
}

fn wal_op() -> impl Strategy<Value = WalOp> {
    prop_oneof![
        2 => Just(WalOp::Append),
        4 => Just(WalOp::Rotate),
        2 => (0..3usize, 0..4u64).prop_map(|(member, lag)| WalOp::Ack { member, lag }),
        1 => (0..3usize).prop_map(|member| WalOp::Forget { member }),
    ]
}

const MEMBERS: [&str; 3] = ["pg-1", "pg-2", "pg-3"];

proptest! {
    /// Property: retained segments are contiguous and end at the open
    /// segment, at most `keep` closed segments are kept beyond what
    /// replicas need, and no acknowledged member ever hits a gap.
    #[test]
    fn test_wal_retention_invariants(
        keep in 0..6u64,
        ops in prop::collection::vec(wal_op(), 1..80)
    ) {
        let mut wal = WalManager::new(keep);
        for op in ops {
            match op {
                WalOp::Append => {
                    wal.append(b"row").unwrap();
                }
                WalOp::Rotate => {
                    wal.rotate().unwrap();
                }
                WalOp::Ack { member, lag } => {
                    // Members only acknowledge segments they could still fetch
                    let oldest = wal.oldest_retained().unwrap();
                    let segment = wal.current_segment().saturating_sub(lag).max(oldest.saturating_sub(1));
                    wal.acknowledge(MEMBERS[member], segment);
                }
                WalOp::Forget { member } => {
                    wal.forget(MEMBERS[member]);
                }
            }

            let numbers: Vec<u64> = wal.segments_since(0).iter().map(|s| s.sequence_number).collect();
            prop_assert!(!numbers.is_empty());
            prop_assert!(numbers.windows(2).all(|w| w[1] == w[0] + 1), "gap in {:?}", numbers);
            prop_assert_eq!(numbers.last().copied(), Some(wal.current_segment()));
            prop_assert!(
                wal.oldest_retained().unwrap() <= wal.current_segment().saturating_sub(keep).max(1)
            );
            for member in MEMBERS {
                if let Some(acked) = wal.acknowledged(member) {
                    prop_assert!(wal.catch_up_from(Some(acked)).is_ok(), "{} lost segment {}", member, acked + 1);
                }
            }
        }
    }
}

// =============================================================================
// Membership registry
// =============================================================================

#[derive(Debug, Clone)]
struct Claim {
    member: usize,
    role: Role,
    term: u64,
}

fn claim() -> impl Strategy<Value = Claim> {
    (
        0..4usize,
        prop_oneof![Just(Role::Primary), Just(Role::Replica), Just(Role::Unknown)],
        0..6u64,
    )
        .prop_map(|(member, role, term)| Claim { member, role, term })
}

fn registry(size: usize) -> MembershipRegistry {
    let peers: Vec<PeerConfig> = (1..size)
        .map(|i| PeerConfig {
            id: format!("pg-{}", i),
            address: format!("pg-{}:8008", i),
        })
        .collect();
    MembershipRegistry::new("pg-0", "pg-0:8008", &peers)
}

proptest! {
    /// Property: whatever peers claim, the registry lists at most one
    /// primary, and an older term never displaces a newer primary.
    #[test]
    fn test_registry_single_primary(claims in prop::collection::vec(claim(), 1..40)) {
        let mut registry = registry(5);
        let now = Instant::now();
        for claim in claims {
            let id = format!("pg-{}", claim.member + 1);
            let before = registry.primary().map(|p| (p.id.clone(), p.lease_term));
            let mut status = MemberStatus::initial(&id, &format!("{}:8008", id));
            status.role = claim.role;
            status.lease_term = claim.term;
            registry.heartbeat(&status, now).unwrap();

            let primaries = registry.snapshot(now).iter().filter(|m| m.role == Role::Primary).count();
            prop_assert!(primaries <= 1);
            if let Some((holder, term)) = before
                && holder != id
                && claim.term < term
            {
                prop_assert_eq!(registry.primary().map(|p| p.id.clone()), Some(holder));
            }
        }
    }

    /// Property: quorum means a strict majority, counting this member.
    #[test]
    fn test_quorum_is_strict_majority(size in 1..8usize, fresh in 0..8usize) {
        let fresh = fresh.min(size - 1);
        let mut registry = registry(size);
        let now = Instant::now();
        for i in 1..=fresh {
            let id = format!("pg-{}", i);
            registry.heartbeat(&MemberStatus::initial(&id, &format!("{}:8008", id)), now).unwrap();
        }
        let reachable = registry.is_quorum_reachable(now, Duration::from_secs(30));
        prop_assert_eq!(reachable, (fresh + 1) * 2 > size);
    }
}
