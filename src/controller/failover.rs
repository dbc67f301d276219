//! Failover control loop.
//!
//! One [`FailoverController`] runs per member. Every cycle it:
//!
//! 1. probes the local database process,
//! 2. heartbeats its peers and updates the membership registry,
//! 3. syncs WAL bookkeeping with the database,
//! 4. renews (as primary) or observes the leader lease,
//! 5. derives an event from the observation and drives the role state
//!    machine, running an election when it becomes a candidate,
//! 6. restarts or re-clones the local database when needed,
//! 7. publishes its status for peers and the API.
//!
//! Writes are only allowed while the [`WriteGate`](super::fencing::WriteGate)
//! is open, and the gate is closed before any role is given up.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::context::Context;
use super::error::{Error, Result};
use super::state_machine::{
    LeaseObservation, MemberEvent, MemberState, MemberStateMachine, Observation,
    TransitionContext, TransitionResult, determine_event,
};
use super::status::{ClusterStatus, MemberStatus};
use crate::client::{AdminChannel, PeerTransport, Workload};
use crate::config::DynamicSettings;
use crate::election::{Lease, LeaderElection, LeaseBackend};
use crate::monitor::{LivenessTracker, ProcessMonitor, ProcessProbe, ProcessState};
use crate::registry::Role;
use crate::retry::Backoff;

/// External collaborators of the control loop.
pub struct Collaborators {
    pub lease_backend: Arc<dyn LeaseBackend>,
    pub peers: Arc<dyn PeerTransport>,
    pub admin: Arc<dyn AdminChannel>,
    pub workload: Arc<dyn Workload>,
    pub probe: Arc<dyn ProcessProbe>,
}

/// Per-member failover controller.
pub struct FailoverController {
    ctx: Arc<Context>,
    election: LeaderElection,
    peers: Arc<dyn PeerTransport>,
    admin: Arc<dyn AdminChannel>,
    workload: Arc<dyn Workload>,
    monitor: ProcessMonitor,
    fsm: MemberStateMachine,
    state: MemberState,
    /// Lease held by this member
    lease: Option<Lease>,
    /// Highest lease term seen
    observed_term: u64,
    settings: DynamicSettings,
    settings_rx: watch::Receiver<DynamicSettings>,
    backoff: Backoff,
    next_election_at: Option<Instant>,
    candidate_since: Option<Instant>,
    /// Lease holder being followed
    primary: Option<String>,
    primary_liveness: LivenessTracker,
    restart_backoff: Duration,
    last_restart: Option<Instant>,
    /// Database must restart as a standby before serving again
    needs_rejoin: bool,
    /// Primary address the local standby was last pointed at
    upstream: Option<String>,
    /// Next forced clone ignores any known position
    full_clone: bool,
    /// Newest WAL segment written or replayed locally
    wal_position: Option<u64>,
    /// Our position as last acknowledged by the primary
    acked_by_primary: Option<u64>,
    /// System identifier of the local data directory
    system_id: Option<u64>,
    /// Local data directory belongs to another cluster
    foreign_data: bool,
    cluster_status: Option<ClusterStatus>,
}

impl FailoverController {
    pub fn new(ctx: Arc<Context>, deps: Collaborators, restart_backoff: Duration) -> Self {
        let settings_rx = ctx.subscribe_settings();
        let settings = *settings_rx.borrow();
        Self {
            election: LeaderElection::new(deps.lease_backend, settings.retry_timeout()),
            peers: deps.peers,
            admin: deps.admin,
            workload: deps.workload,
            monitor: ProcessMonitor::new(deps.probe),
            fsm: MemberStateMachine::new(),
            state: MemberState::Unknown,
            lease: None,
            observed_term: 0,
            backoff: Backoff::new(settings.loop_wait(), settings.max_election_backoff()),
            settings,
            settings_rx,
            next_election_at: None,
            candidate_since: None,
            primary: None,
            primary_liveness: LivenessTracker::new(Instant::now()),
            restart_backoff,
            last_restart: None,
            needs_rejoin: false,
            upstream: None,
            full_clone: false,
            wal_position: None,
            acked_by_primary: None,
            system_id: None,
            foreign_data: false,
            cluster_status: None,
            ctx,
        }
    }

    pub fn state(&self) -> MemberState {
        self.state
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Run cycles every `loop_wait` until `shutdown` fires, then fence and
    /// release any lease held.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(member = %self.ctx.member_id, "Starting failover control loop");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.run_cycle() => {
                    if let Err(e) = result {
                        error!(member = %self.ctx.member_id, error = %e, "Control loop cycle failed");
                    }
                }
            }
            let wait = self.settings.loop_wait();
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Execute one control loop cycle.
    pub async fn run_cycle(&mut self) -> Result<()> {
        let started = Instant::now();
        self.refresh_settings();
        self.enforce_lease_deadline();

        let process = self.monitor.check();
        let database_running = process.is_running();

        self.heartbeat_peers().await;
        let wal_result = self.track_wal(database_running).await;

        let lease = self.observe_lease().await;
        let now = Instant::now();
        let (quorum_reachable, peer_wal_position) = {
            let registry = self.ctx.registry.read().await;
            let member_ttl = self.settings.member_ttl();
            (
                registry.is_quorum_reachable(now, member_ttl),
                registry.freshest_electable_position(now, member_ttl),
            )
        };
        let data_present = self.workload.data_present().await;
        self.verify_identity(database_running, data_present).await;

        let tctx = TransitionContext {
            quorum_reachable,
            blocked: self.ctx.is_blocked(),
            database_running,
            data_present,
            backoff_elapsed: self.next_election_at.is_none_or(|at| now >= at),
            wal_position: self.wal_position,
            peer_wal_position,
        };
        let observation = Observation {
            lease,
            primary_silent_for: self.primary_liveness.unreachable_for(now),
            detection_window: self.settings.detection_window(),
            candidate_for: self
                .candidate_since
                .map(|since| now.saturating_duration_since(since))
                .unwrap_or_default(),
            candidate_timeout: self.settings.candidate_timeout(),
            quorum_reachable,
            database_running,
        };

        if let Some(event) = determine_event(&self.state, &observation) {
            self.handle_event(event, &tctx).await;
        }
        if self.state == MemberState::Candidate {
            self.run_election(&tctx).await;
        }

        let electable = matches!(self.state, MemberState::Replica | MemberState::Candidate)
            && database_running
            && data_present
            && !self.ctx.is_blocked();
        self.recover(process, data_present).await;
        self.publish_status(electable).await;

        let health = &self.ctx.health_state;
        health.metrics.record_cycle(started.elapsed().as_secs_f64());
        health.record_cycle();
        health.set_ready(true).await;
        wal_result
    }

    fn refresh_settings(&mut self) {
        if !self.settings_rx.has_changed().unwrap_or(false) {
            return;
        }
        let settings = *self.settings_rx.borrow_and_update();
        if settings == self.settings {
            return;
        }
        info!(
            loop_wait = settings.loop_wait,
            ttl = settings.ttl,
            retry_timeout = settings.retry_timeout,
            wal_keep_segments = settings.wal_keep_segments,
            "Applying updated settings"
        );
        self.election.set_call_timeout(settings.retry_timeout());
        self.backoff = Backoff::new(settings.loop_wait(), settings.max_election_backoff());
        self.settings = settings;
    }

    /// A primary past its local lease deadline stops writing at once.
    fn enforce_lease_deadline(&self) {
        if self.state == MemberState::Primary && self.lease.as_ref().is_none_or(|l| l.is_expired()) {
            self.ctx.gate.close("local lease deadline passed");
        }
    }

    async fn heartbeat_peers(&mut self) {
        let targets: Vec<(String, String)> = {
            let registry = self.ctx.registry.read().await;
            registry
                .snapshot(Instant::now())
                .into_iter()
                .filter(|m| m.id != self.ctx.member_id)
                .map(|m| (m.id, m.address))
                .collect()
        };
        let peers = &self.peers;
        let results = join_all(targets.into_iter().map(|(id, address)| async move {
            let result = peers.heartbeat(&address).await;
            (id, result)
        }))
        .await;

        let now = Instant::now();
        let is_primary = self.state == MemberState::Primary;
        let mut registry = self.ctx.registry.write().await;
        let mut wal = self.ctx.wal.write().await;
        for (id, result) in results {
            let status = match result {
                Ok(status) if status.id == id => status,
                Ok(status) => {
                    warn!(expected = %id, answered = %status.id, "Peer answered with another identity");
                    continue;
                }
                Err(e) => {
                    debug!(peer = %id, error = %e, "Heartbeat failed");
                    continue;
                }
            };
            if let Err(e) = registry.heartbeat(&status, now) {
                debug!(peer = %id, error = %e, "Heartbeat from unregistered member");
                continue;
            }
            registry.merge(&status.members, self.settings.member_ttl());
            if self.primary.as_deref() == Some(id.as_str()) {
                self.primary_liveness.record_healthy(now);
            }
            if status.role == Role::Primary {
                if let Some(own) = status.members.iter().find(|m| m.id == self.ctx.member_id) {
                    self.acked_by_primary = own.wal_acked.or(self.acked_by_primary);
                }
            } else if is_primary && let Some(position) = status.wal_position {
                wal.acknowledge(&id, position);
            }
        }
        registry.touch_self(now);
        let member_ttl = self.settings.member_ttl();
        for removed in registry.expire(now, member_ttl) {
            wal.forget(&removed);
        }
        // Unreachable members stop pinning WAL segments
        for view in registry.snapshot(now) {
            let stale = view
                .heartbeat_age_ms
                .is_none_or(|age| Duration::from_millis(age) > member_ttl);
            if stale
                && view.id != self.ctx.member_id
                && let Some(acked) = wal.forget(&view.id)
            {
                info!(member = %view.id, acked, "Releasing WAL retained for unreachable member");
            }
        }
    }

    async fn track_wal(&mut self, database_running: bool) -> Result<()> {
        if !database_running {
            return Ok(());
        }
        let position = match self.state {
            MemberState::Primary => self.admin.current_segment().await.map(Some),
            _ => self.admin.replayed_segment().await,
        };
        let segment = match position {
            Ok(Some(segment)) => segment,
            Ok(None) => return Ok(()),
            Err(e) => {
                debug!(error = %e, "Could not read WAL position");
                return Ok(());
            }
        };
        self.wal_position = Some(segment);

        let primary_timeline = {
            let registry = self.ctx.registry.read().await;
            registry
                .primary()
                .filter(|p| p.id != self.ctx.member_id)
                .map(|p| p.timeline)
        };
        let mut wal = self.ctx.wal.write().await;
        if self.state != MemberState::Primary
            && let Some(timeline) = primary_timeline
        {
            wal.adopt_timeline(timeline)?;
        }
        for rotation in wal.sync_to(segment)? {
            if !rotation.discarded.is_empty() {
                debug!(
                    closed = rotation.closed,
                    discarded = rotation.discarded.len(),
                    "Released WAL segments"
                );
            }
        }
        self.ctx
            .health_state
            .metrics
            .wal_segments_retained
            .set(i64::try_from(wal.retained_count()).unwrap_or(i64::MAX));
        Ok(())
    }

    async fn observe_lease(&mut self) -> LeaseObservation {
        if self.state == MemberState::Primary {
            return self.renew_lease().await;
        }
        match self.election.observe().await {
            Ok(Some(lease)) if lease.is_expired() => {
                self.observed_term = self.observed_term.max(lease.term);
                self.forget_primary().await;
                LeaseObservation::Vacant
            }
            Ok(Some(lease)) if lease.is_held_by(&self.ctx.member_id) => {
                self.observed_term = self.observed_term.max(lease.term);
                self.lease = Some(lease);
                LeaseObservation::HeldBySelf
            }
            Ok(Some(lease)) => {
                self.follow(&lease).await;
                LeaseObservation::HeldByOther {
                    holder: lease.holder_id,
                }
            }
            Ok(None) => {
                self.forget_primary().await;
                LeaseObservation::Vacant
            }
            Err(e) => {
                warn!(member = %self.ctx.member_id, error = %e, "Cannot observe leader lease");
                LeaseObservation::Unreachable
            }
        }
    }

    /// Renew our lease, giving up at the local lease deadline.
    async fn renew_lease(&mut self) -> LeaseObservation {
        let Some(lease) = self.lease.clone() else {
            return LeaseObservation::Vacant;
        };
        let result =
            match tokio::time::timeout_at(lease.expires_at, self.election.renew(&lease)).await {
                Ok(result) => result,
                Err(_) => Err(Error::LeaseExpired(format!(
                    "local deadline for term {} passed during renew",
                    lease.term
                ))),
            };
        match result {
            Ok(renewed) => {
                self.ctx.gate.extend(renewed.expires_at);
                self.lease = Some(renewed);
                LeaseObservation::HeldBySelf
            }
            Err(Error::BackendUnreachable(reason)) => {
                self.ctx.health_state.metrics.lease_renew_failures.inc();
                warn!(member = %self.ctx.member_id, reason = %reason, "Lease renewal could not reach the backend");
                LeaseObservation::Unreachable
            }
            Err(e) => {
                self.ctx.health_state.metrics.lease_renew_failures.inc();
                // Fence before the role is relinquished
                self.ctx.gate.close("lease renewal failed");
                warn!(member = %self.ctx.member_id, term = lease.term, error = %e, "Lost leader lease");
                LeaseObservation::Vacant
            }
        }
    }

    async fn follow(&mut self, lease: &Lease) {
        self.observed_term = self.observed_term.max(lease.term);
        if self.primary.as_deref() != Some(lease.holder_id.as_str()) {
            info!(
                member = %self.ctx.member_id,
                primary = %lease.holder_id,
                term = lease.term,
                "Following primary"
            );
            self.primary = Some(lease.holder_id.clone());
            self.primary_liveness.reset(Instant::now());
        }
        let mut registry = self.ctx.registry.write().await;
        if registry.get(&lease.holder_id).is_some() {
            if let Err(e) = registry.update_term(&lease.holder_id, lease.term) {
                warn!(member = %lease.holder_id, error = %e, "Failed to record primary term");
            }
            if let Err(e) = registry.update_role(&lease.holder_id, Role::Primary) {
                warn!(member = %lease.holder_id, error = %e, "Failed to record primary");
            }
        }
    }

    /// Without a live lease nobody may be listed as primary.
    async fn forget_primary(&mut self) {
        self.primary = None;
        let mut registry = self.ctx.registry.write().await;
        let stale = registry.primary().map(|p| p.id.clone());
        if let Some(stale) = stale {
            debug!(member = %stale, "Lease vacant, clearing primary from registry");
            if let Err(e) = registry.update_role(&stale, Role::Unknown) {
                warn!(member = %stale, error = %e, "Failed to clear stale primary");
            }
        }
    }

    async fn handle_event(&mut self, event: MemberEvent, tctx: &TransitionContext) {
        match self.fsm.transition(&self.state, event, tctx) {
            TransitionResult::Success {
                from,
                to,
                description,
                ..
            } => {
                info!(
                    member = %self.ctx.member_id,
                    from = %from,
                    to = %to,
                    event = %event,
                    "{}",
                    description
                );
                self.enter(from, to, event).await;
            }
            TransitionResult::GuardFailed { from, to, reason, .. } => {
                debug!(from = %from, to = %to, event = %event, reason = %reason, "Transition blocked by guard");
            }
            TransitionResult::InvalidTransition { current, event } => {
                warn!(state = %current, event = %event, "Ignoring event without a transition");
            }
        }
    }

    async fn enter(&mut self, from: MemberState, to: MemberState, event: MemberEvent) {
        if from == MemberState::Primary {
            self.step_down(event).await;
        }
        match to {
            MemberState::Candidate => self.candidate_since = Some(Instant::now()),
            MemberState::Unknown => {
                self.ctx.gate.close("consensus backend unreachable");
                self.candidate_since = None;
            }
            MemberState::Replica => {
                if event == MemberEvent::CandidateTimeout {
                    let err = Error::DetectionTimeout(format!(
                        "no leader elected within {:?}",
                        self.settings.candidate_timeout()
                    ));
                    warn!(member = %self.ctx.member_id, error = %err, "Candidate reverting to replica");
                    self.schedule_next_election();
                }
                self.candidate_since = None;
            }
            MemberState::Primary => self.candidate_since = None,
        }
        self.state = to;
    }

    /// Fence, release the lease and demote the database.
    async fn step_down(&mut self, event: MemberEvent) {
        if self.ctx.gate.close(&format!("stepping down: {}", event)) {
            self.ctx
                .publish_warning_event("Fenced", "Fence", Some(format!("writes stopped after {}", event)))
                .await;
        }
        if let Some(lease) = self.lease.take()
            && event != MemberEvent::BackendUnreachable
            && let Err(e) = self.election.release(&lease).await
        {
            warn!(member = %self.ctx.member_id, error = %e, "Failed to release lease while stepping down");
        }
        self.needs_rejoin = true;
        if event != MemberEvent::DatabaseDown {
            let leader = self.leader_endpoint().await.map(|(_, address)| address);
            match self.workload.demote(leader.as_deref()).await {
                Ok(()) => {
                    self.needs_rejoin = false;
                    self.upstream = leader;
                }
                Err(e) => warn!(member = %self.ctx.member_id, error = %e, "Demotion failed"),
            }
        }
        self.ctx
            .publish_warning_event("Demoted", "Demote", Some(format!("stepped down after {}", event)))
            .await;
    }

    fn schedule_next_election(&mut self) {
        let delay = self.backoff.next_delay();
        self.next_election_at = Some(Instant::now() + delay);
        debug!(member = %self.ctx.member_id, retry_in = ?delay, "Next election deferred");
    }

    async fn run_election(&mut self, tctx: &TransitionContext) {
        let member_id = self.ctx.member_id.clone();
        let health = self.ctx.health_state.clone();
        match self.election.acquire(&member_id, self.settings.ttl()).await {
            Ok(lease) => {
                // Quorum and peer positions may have changed while acquiring
                let (quorum_reachable, peer_wal_position) = {
                    let registry = self.ctx.registry.read().await;
                    let now = Instant::now();
                    let member_ttl = self.settings.member_ttl();
                    (
                        registry.is_quorum_reachable(now, member_ttl),
                        registry.freshest_electable_position(now, member_ttl),
                    )
                };
                let tctx = TransitionContext {
                    quorum_reachable,
                    blocked: self.ctx.is_blocked(),
                    peer_wal_position,
                    ..*tctx
                };
                match self.fsm.transition(&self.state, MemberEvent::LeaseAcquired, &tctx) {
                    TransitionResult::Success { .. } => self.promote(lease).await,
                    other => {
                        warn!(member = %member_id, result = ?other, "Won the lease but cannot promote, releasing");
                        health.metrics.record_election("aborted");
                        if let Err(e) = self.election.release(&lease).await {
                            warn!(member = %member_id, error = %e, "Failed to release lease");
                        }
                    }
                }
            }
            Err(Error::LeaseHeld { holder, term }) => {
                self.observed_term = self.observed_term.max(term);
                health.metrics.record_election("lost");
                info!(member = %member_id, winner = %holder, term, "Lost election");
                self.schedule_next_election();
                self.handle_event(MemberEvent::LeaseHeld, tctx).await;
            }
            Err(e @ Error::BackendUnreachable(_)) => {
                health.metrics.record_election("unreachable");
                warn!(member = %member_id, error = %e, "Election could not reach the backend");
                self.handle_event(MemberEvent::BackendUnreachable, tctx).await;
            }
            Err(e) => {
                health.metrics.record_election("failed");
                warn!(member = %member_id, error = %e, "Election attempt failed");
            }
        }
    }

    async fn promote(&mut self, lease: Lease) {
        let term = lease.term;
        let deadline = lease.expires_at;
        self.enter(MemberState::Candidate, MemberState::Primary, MemberEvent::LeaseAcquired)
            .await;
        self.lease = Some(lease);
        self.observed_term = self.observed_term.max(term);
        self.primary = None;
        self.backoff.reset();
        self.next_election_at = None;

        let timeline = self.ctx.wal.write().await.open_timeline();
        {
            let mut registry = self.ctx.registry.write().await;
            let recorded = registry
                .update_term(&self.ctx.member_id, term)
                .and_then(|()| registry.update_role(&self.ctx.member_id, Role::Primary));
            if let Err(e) = recorded {
                warn!(member = %self.ctx.member_id, error = %e, "Failed to record own promotion");
            }
        }
        let promoted = match timeline {
            Ok(timeline) => self.workload.promote().await.map(|()| timeline),
            Err(e) => Err(e),
        };
        match promoted {
            Ok(timeline) => {
                self.ctx.gate.open(term, deadline);
                self.needs_rejoin = false;
                let metrics = &self.ctx.health_state.metrics;
                metrics.failovers.inc();
                metrics.record_election("won");
                info!(member = %self.ctx.member_id, term, timeline, "Promoted to primary");
                self.ctx
                    .publish_normal_event(
                        "Promoted",
                        "Promote",
                        Some(format!("term {} timeline {}", term, timeline)),
                    )
                    .await;
            }
            Err(e) => {
                error!(member = %self.ctx.member_id, error = %e, "Promotion failed, stepping down");
                self.handle_event(MemberEvent::DatabaseDown, &TransitionContext::default())
                    .await;
            }
        }
    }

    async fn recover(&mut self, process: ProcessState, data_present: bool) {
        if self.state == MemberState::Primary || self.foreign_data {
            return;
        }
        if !data_present {
            self.forced_clone().await;
            return;
        }
        match process {
            ProcessState::Missing | ProcessState::Zombie => self.restart_database().await,
            ProcessState::Running if self.needs_rejoin => self.restart_database().await,
            ProcessState::Running => {
                // Re-point the standby when the primary changed
                if self.state == MemberState::Replica
                    && let Some((_, address)) = self.leader_endpoint().await
                    && self.upstream.as_deref() != Some(address.as_str())
                {
                    self.needs_rejoin = true;
                    self.restart_database().await;
                }
            }
            // A frozen process cannot be restarted cleanly; wait for it
            ProcessState::Stopped => {}
        }
    }

    /// Block a member whose data directory was initialised by another
    /// cluster. It stays blocked, and untouched, until the data matches the
    /// primary's again or is removed.
    async fn verify_identity(&mut self, database_running: bool, data_present: bool) {
        if !data_present {
            self.system_id = None;
            self.foreign_data = false;
            return;
        }
        if database_running {
            match self.admin.system_identifier().await {
                Ok(Some(id)) => self.system_id = Some(id),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Could not read system identifier"),
            }
        }
        if self.state == MemberState::Primary {
            return;
        }
        let expected = self.ctx.registry.read().await.cluster_system_id();
        let (Some(local), Some(expected)) = (self.system_id, expected) else {
            return;
        };
        if local == expected {
            if std::mem::take(&mut self.foreign_data) {
                info!(member = %self.ctx.member_id, system_id = local, "Data directory matches the cluster again");
            }
            return;
        }
        self.foreign_data = true;
        if self.ctx.is_blocked() {
            return;
        }
        self.ctx.set_blocked(true);
        self.ctx.gate.close("foreign data directory");
        let err = Error::ForeignStorage(format!(
            "system identifier {} differs from the cluster's {}",
            local, expected
        ));
        error!(member = %self.ctx.member_id, error = %err, "Data directory belongs to another cluster, manual intervention required");
        self.ctx
            .publish_warning_event("ForeignStorage", "Verify", Some(err.to_string()))
            .await;
    }

    /// Restart the database, as a standby when it was primary before.
    async fn restart_database(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_restart
            && now.saturating_duration_since(last) < self.restart_backoff
        {
            debug!(member = %self.ctx.member_id, "Restart suppressed by backoff");
            return;
        }
        self.last_restart = Some(now);
        let result = if self.needs_rejoin {
            let leader = self.leader_endpoint().await.map(|(_, address)| address);
            let demoted = self.workload.demote(leader.as_deref()).await;
            if demoted.is_ok() {
                self.upstream = leader;
            }
            demoted
        } else {
            self.workload.restart().await
        };
        match result {
            Ok(()) => {
                let rejoined = std::mem::take(&mut self.needs_rejoin);
                info!(
                    member = %self.ctx.member_id,
                    as_standby = rejoined,
                    upstream = ?self.upstream,
                    "Database restarted"
                );
                self.ctx
                    .publish_normal_event("Restarted", "Restart", None)
                    .await;
            }
            Err(e) => warn!(member = %self.ctx.member_id, error = %e, "Database restart failed"),
        }
    }

    /// Rebuild an empty data directory from the primary.
    async fn forced_clone(&mut self) {
        if self.ctx.is_blocked() {
            debug!(member = %self.ctx.member_id, "Blocked, not cloning");
            return;
        }
        let Some((primary, address)) = self.leader_endpoint().await else {
            debug!(member = %self.ctx.member_id, "Data directory empty but no primary to clone from");
            return;
        };
        let since = if self.full_clone {
            None
        } else {
            self.wal_position.or(self.acked_by_primary)
        };
        info!(member = %self.ctx.member_id, primary = %primary, since = ?since, "Data directory empty, starting forced clone");

        match self.peers.fetch_segments(&address, since).await {
            Ok(segments) => {
                if let Err(e) = self.workload.clone_from_leader(&address).await {
                    warn!(member = %self.ctx.member_id, error = %e, "Clone failed");
                    return;
                }
                self.upstream = Some(address.clone());
                self.full_clone = false;
                if let Some(last) = segments.last() {
                    let mut wal = self.ctx.wal.write().await;
                    let synced = wal
                        .adopt_timeline(last.timeline)
                        .and_then(|()| wal.sync_to(last.sequence_number));
                    if let Err(e) = synced {
                        warn!(error = %e, "Failed to sync WAL bookkeeping after clone");
                    }
                    self.wal_position = Some(last.sequence_number);
                }
                self.needs_rejoin = false;
                self.last_restart = None;
                self.ctx
                    .publish_normal_event(
                        "Cloned",
                        "Clone",
                        Some(format!("{} segments from {}", segments.len(), primary)),
                    )
                    .await;
                self.restart_database().await;
            }
            Err(e) if e.is_fatal() => {
                self.ctx.set_blocked(true);
                // Once an operator unblocks, rebuild from scratch
                self.full_clone = true;
                self.ctx.gate.close("data gap");
                error!(member = %self.ctx.member_id, error = %e, "Forced clone impossible, manual intervention required");
                self.ctx
                    .publish_warning_event("Blocked", "Clone", Some(e.to_string()))
                    .await;
            }
            Err(e) => warn!(member = %self.ctx.member_id, error = %e, "Fetching WAL segments failed"),
        }
    }

    /// Id and address of the primary this member should follow.
    async fn leader_endpoint(&self) -> Option<(String, String)> {
        let registry = self.ctx.registry.read().await;
        registry
            .primary()
            .filter(|p| p.id != self.ctx.member_id)
            .or_else(|| self.primary.as_deref().and_then(|id| registry.get(id)))
            .map(|p| (p.id.clone(), p.address.clone()))
    }

    async fn publish_status(&mut self, electable: bool) {
        let now = Instant::now();
        let role = self.state.role();
        let (members, primary) = {
            let mut registry = self.ctx.registry.write().await;
            if let Err(e) = registry.update_role(&self.ctx.member_id, role) {
                warn!(member = %self.ctx.member_id, error = %e, "Failed to record own role");
            }
            if let Some(lease) = &self.lease
                && let Err(e) = registry.update_term(&self.ctx.member_id, lease.term)
            {
                warn!(member = %self.ctx.member_id, error = %e, "Failed to record own term");
            }
            (
                registry.snapshot(now),
                registry.primary().map(|p| p.id.clone()),
            )
        };
        let timeline = self.ctx.wal.read().await.timeline();
        let blocked = self.ctx.is_blocked();
        self.ctx.publish_status(MemberStatus {
            id: self.ctx.member_id.clone(),
            address: self.ctx.address.clone(),
            role,
            state: self.state,
            lease_term: self.lease.as_ref().map(|l| l.term).unwrap_or(self.observed_term),
            timeline,
            wal_position: self.wal_position,
            writes_open: self.ctx.gate.is_open(),
            blocked,
            electable,
            system_id: self.system_id,
            members,
        });
        self.ctx.health_state.metrics.set_role(role);

        let cluster = ClusterStatus::evaluate(blocked, primary.as_deref());
        if self.cluster_status.as_ref() != Some(&cluster) {
            info!(member = %self.ctx.member_id, status = %cluster, "Cluster status changed");
            self.cluster_status = Some(cluster);
        }
    }

    /// Fence and give up the lease before exiting.
    async fn shutdown(&mut self) {
        info!(member = %self.ctx.member_id, "Failover control loop shutting down");
        self.ctx.gate.close("shutdown");
        let lease = match self.lease.take() {
            Some(lease) => Some(lease),
            // A cancelled acquire may still have been applied
            None => self
                .election
                .observe()
                .await
                .ok()
                .flatten()
                .filter(|l| l.is_held_by(&self.ctx.member_id)),
        };
        if let Some(lease) = lease
            && let Err(e) = self.election.release(&lease).await
        {
            warn!(member = %self.ctx.member_id, error = %e, "Failed to release lease on shutdown");
        }
        self.state = MemberState::Unknown;
        self.publish_status(false).await;
        self.ctx.health_state.set_ready(false).await;
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
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;

    use crate::election::{InMemoryLeaseBackend, LeaseStore};
    use crate::health::HealthState;
    use crate::registry::MembershipRegistry;
    use crate::wal::{WalManager, WalSegment};

    struct NoPeers;

    #[async_trait]
    impl PeerTransport for NoPeers {
        async fn heartbeat(&self, address: &str) -> Result<MemberStatus> {
            Err(Error::Peer(format!("{} unreachable", address)))
        }

        async fn fetch_segments(&self, address: &str, _since: Option<u64>) -> Result<Vec<WalSegment>> {
            Err(Error::Peer(format!("{} unreachable", address)))
        }
    }

    #[derive(Default)]
    struct LocalDb {
        segment: AtomicU64,
        actions: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl AdminChannel for LocalDb {
        async fn switch_wal(&self) -> Result<u64> {
            Ok(self.segment.fetch_add(1, Ordering::SeqCst))
        }

        async fn checkpoint(&self) -> Result<()> {
            Ok(())
        }

        async fn current_segment(&self) -> Result<u64> {
            Ok(self.segment.load(Ordering::SeqCst))
        }

        async fn replayed_segment(&self) -> Result<Option<u64>> {
            Ok(None)
        }

        async fn is_ready(&self) -> bool {
            true
        }
    }

    #[async_trait]
    impl Workload for LocalDb {
        async fn promote(&self) -> Result<()> {
            self.actions.lock().unwrap().push("promote");
            Ok(())
        }

        async fn demote(&self, _leader: Option<&str>) -> Result<()> {
            self.actions.lock().unwrap().push("demote");
            Ok(())
        }

        async fn restart(&self) -> Result<()> {
            self.actions.lock().unwrap().push("restart");
            Ok(())
        }

        async fn clone_from_leader(&self, _leader: &str) -> Result<()> {
            self.actions.lock().unwrap().push("clone");
            Ok(())
        }

        async fn data_present(&self) -> bool {
            true
        }
    }

    struct AlwaysRunning;

    impl ProcessProbe for AlwaysRunning {
        fn probe(&self) -> ProcessState {
            ProcessState::Running
        }
    }

    fn single_member(backend: InMemoryLeaseBackend) -> (FailoverController, Arc<LocalDb>) {
        let ctx = Arc::new(Context::new(
            None,
            "default",
            MembershipRegistry::new("pg-0", "pg-0:8008", &[]),
            WalManager::starting_at(3, 1, 4),
            "pg-0:8008",
            DynamicSettings::default(),
            Arc::new(HealthState::new()),
        ));
        let db = Arc::new(LocalDb::default());
        db.segment.store(3, Ordering::SeqCst);
        let controller = FailoverController::new(
            ctx,
            Collaborators {
                lease_backend: Arc::new(backend),
                peers: Arc::new(NoPeers),
                admin: db.clone(),
                workload: db.clone(),
                probe: Arc::new(AlwaysRunning),
            },
            Duration::from_secs(30),
        );
        (controller, db)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_member_bootstraps_to_primary() {
        let (mut controller, db) = single_member(InMemoryLeaseBackend::standalone());

        controller.run_cycle().await.unwrap();
        assert_eq!(controller.state(), MemberState::Replica);
        assert!(!controller.context().gate.is_open());

        controller.run_cycle().await.unwrap();
        assert_eq!(controller.state(), MemberState::Primary);
        assert!(controller.context().gate.is_open());
        assert_eq!(controller.context().wal.read().await.timeline(), 2);
        assert_eq!(db.actions.lock().unwrap().as_slice(), &["promote"]);

        let status = controller.context().status();
        assert!(status.is_primary());
        assert_eq!(status.lease_term, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_loss_closes_gate() {
        let backend = InMemoryLeaseBackend::standalone();
        let (mut controller, db) = single_member(backend.clone());
        controller.run_cycle().await.unwrap();
        controller.run_cycle().await.unwrap();
        assert!(controller.context().gate.is_open());

        backend.set_reachable(false);
        controller.run_cycle().await.unwrap();
        assert_eq!(controller.state(), MemberState::Unknown);
        assert!(!controller.context().gate.is_open());
        assert!(db.actions.lock().unwrap().contains(&"demote"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_lease() {
        let store = LeaseStore::new();
        let backend = InMemoryLeaseBackend::connect(store.clone());
        let (mut controller, _db) = single_member(backend);
        controller.run_cycle().await.unwrap();
        controller.run_cycle().await.unwrap();
        assert!(store.peek().await.unwrap().is_live());

        let ctx = controller.context().clone();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(controller.run(rx));
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert!(!ctx.gate.is_open());
        assert!(!store.peek().await.unwrap().is_live());
        assert!(!ctx.health_state.is_ready().await);
    }
}
