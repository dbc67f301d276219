//! Storage reattachment state machine.
//!
//! `Bound(old owner) → Detaching → Unbound → Rebinding → Bound(new owner)`
//!
//! Reuse protocol, in order:
//! 1. set the source volume's reclaim policy to `Retain`
//! 2. remove the application that used it
//! 3. delete the stale claims (source claim and the target claim)
//! 4. clear the volume's claim reference
//! 5. build the new claim from the target claim's identity
//! 6. apply it
//! 7. restore the original reclaim policy
//!
//! Any failure leaves the volume `Unbound`. Every step is idempotent, so
//! running the whole protocol again converges on the same bound state.

use std::fmt;
use std::sync::Arc;

use jiff::Timestamp;
use serde::Serialize;
use tracing::{info, warn};

use super::{ClaimRecord, Orchestrator, ReclaimPolicy, StorageApi, StorageSnapshot};
use crate::controller::error::{Error, Result};
use crate::retry::{RetryPolicy, poll_until, retry};

/// Reattachment states of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReattachState {
    /// Bound to a claim; carries the member whose data it holds.
    Bound { owner: Option<String> },
    Detaching,
    Unbound,
    Rebinding,
}

impl fmt::Display for ReattachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReattachState::Bound { owner: Some(o) } => write!(f, "Bound({})", o),
            ReattachState::Bound { owner: None } => write!(f, "Bound"),
            ReattachState::Detaching => write!(f, "Detaching"),
            ReattachState::Unbound => write!(f, "Unbound"),
            ReattachState::Rebinding => write!(f, "Rebinding"),
        }
    }
}

/// One entry of the transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub from: ReattachState,
    pub to: ReattachState,
    pub step: String,
    pub at: Timestamp,
}

/// Drives a single volume through detach and rebind.
pub struct ReattachmentCoordinator {
    storage: Arc<dyn StorageApi>,
    orchestrator: Arc<dyn Orchestrator>,
    snapshot: StorageSnapshot,
    /// Application removed during detach, if any.
    application: Option<String>,
    state: ReattachState,
    log: Vec<TransitionRecord>,
    policy: RetryPolicy,
}

impl ReattachmentCoordinator {
    pub fn new(
        storage: Arc<dyn StorageApi>,
        orchestrator: Arc<dyn Orchestrator>,
        snapshot: StorageSnapshot,
        policy: RetryPolicy,
    ) -> Self {
        let state = ReattachState::Bound {
            owner: snapshot.member_id.clone(),
        };
        Self {
            storage,
            orchestrator,
            snapshot,
            application: None,
            state,
            log: Vec::new(),
            policy,
        }
    }

    /// Remove `application` as part of the detach.
    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    pub fn state(&self) -> &ReattachState {
        &self.state
    }

    pub fn log(&self) -> &[TransitionRecord] {
        &self.log
    }

    pub fn snapshot(&self) -> &StorageSnapshot {
        &self.snapshot
    }

    fn transition(&mut self, to: ReattachState, step: impl Into<String>) {
        let record = TransitionRecord {
            from: self.state.clone(),
            to: to.clone(),
            step: step.into(),
            at: Timestamp::now(),
        };
        info!(
            volume = %self.snapshot.volume.name,
            from = %record.from,
            to = %record.to,
            step = %record.step,
            "Reattachment transition"
        );
        self.log.push(record);
        self.state = to;
    }

    fn fail(&mut self, step: &str, err: Error) -> Error {
        warn!(volume = %self.snapshot.volume.name, step, error = %err, "Reattachment step failed");
        if self.state != ReattachState::Unbound {
            self.transition(ReattachState::Unbound, format!("failed: {}", step));
        }
        err
    }

    /// Detach the volume from its claims (steps 1 to 4).
    ///
    /// Fails with `StillMounted` when a pod keeps using a claim past the
    /// retry budget.
    pub async fn detach(&mut self) -> Result<()> {
        match self.state {
            ReattachState::Bound { .. } | ReattachState::Unbound => {}
            ref other => {
                return Err(Error::Validation(format!("cannot detach while {}", other)));
            }
        }
        self.transition(ReattachState::Detaching, "detach");
        match self.detach_steps().await {
            Ok(()) => {
                self.transition(ReattachState::Unbound, "claim reference cleared");
                Ok(())
            }
            Err(e) => Err(self.fail("detach", e)),
        }
    }

    async fn detach_steps(&self) -> Result<()> {
        let storage = self.storage.as_ref();
        let volume = self.snapshot.volume.name.as_str();

        retry(
            &self.policy,
            move || storage.set_reclaim_policy(volume, ReclaimPolicy::Retain),
            Error::is_transient,
        )
        .await?;

        if let Some(application) = self.application.as_deref() {
            let orchestrator = self.orchestrator.as_ref();
            retry(
                &self.policy,
                move || orchestrator.remove_application(application),
                Error::is_transient,
            )
            .await?;
        }

        let mut stale: Vec<&ClaimRecord> = Vec::new();
        if let Some(source) = &self.snapshot.source_claim {
            stale.push(source);
        }
        if !stale.iter().any(|c| c.same_identity(&self.snapshot.target_claim)) {
            stale.push(&self.snapshot.target_claim);
        }

        for claim in stale {
            let (namespace, name) = (claim.namespace.as_str(), claim.name.as_str());
            poll_until(&self.policy, move || storage.is_mounted(namespace, name), |m| !m)
                .await
                .map_err(|e| match e {
                    Error::Timeout(_) => Error::StillMounted(format!("{} via {}/{}", volume, namespace, name)),
                    other => other,
                })?;
            retry(
                &self.policy,
                move || storage.delete_claim(namespace, name),
                Error::is_transient,
            )
            .await?;
            // Deletion is asynchronous while finalizers run
            poll_until(&self.policy, move || storage.get_claim(namespace, name), |c| c.is_none()).await?;
        }

        retry(&self.policy, move || storage.clear_claim_ref(volume), Error::is_transient).await
    }

    /// Bind the volume to `claim` (steps 5 to 7).
    ///
    /// Fails with `NameConflict` when another live claim references the
    /// volume or the claim name is bound to a different volume. Applying the
    /// same claim again is a no-op.
    pub async fn rebind(&mut self, claim: &ClaimRecord) -> Result<ClaimRecord> {
        match self.state {
            ReattachState::Unbound | ReattachState::Bound { .. } => {}
            ref other => {
                return Err(Error::Validation(format!("cannot rebind while {}", other)));
            }
        }
        self.transition(ReattachState::Rebinding, "rebind");
        match self.rebind_steps(claim).await {
            Ok(bound) => {
                let owner = self.snapshot.member_id.clone();
                self.transition(ReattachState::Bound { owner }, "reclaim policy restored");
                Ok(bound)
            }
            Err(e) => Err(self.fail("rebind", e)),
        }
    }

    async fn rebind_steps(&self, claim: &ClaimRecord) -> Result<ClaimRecord> {
        let storage = self.storage.as_ref();
        let volume_name = self.snapshot.volume.name.as_str();

        let volume = retry(&self.policy, move || storage.get_volume(volume_name), Error::is_transient)
            .await?
            .ok_or_else(|| Error::MissingField(format!("persistent volume {}", volume_name)))?;

        if let Some(reference) = &volume.claim_ref
            && (reference.name != claim.name || reference.namespace != claim.namespace)
        {
            let (namespace, name) = (reference.namespace.as_str(), reference.name.as_str());
            let holder = retry(&self.policy, move || storage.get_claim(namespace, name), Error::is_transient).await?;
            if holder.is_some() {
                return Err(Error::NameConflict(format!(
                    "volume {} is claimed by {}/{}",
                    volume_name, namespace, name
                )));
            }
            // Reference to a claim that no longer exists
            retry(&self.policy, move || storage.clear_claim_ref(volume_name), Error::is_transient).await?;
        }

        let (namespace, name) = (claim.namespace.as_str(), claim.name.as_str());
        if let Some(existing) =
            retry(&self.policy, move || storage.get_claim(namespace, name), Error::is_transient).await?
            && existing.volume_name.as_deref() != Some(volume_name)
        {
            return Err(Error::NameConflict(format!(
                "claim {}/{} is bound to {:?}",
                namespace, name, existing.volume_name
            )));
        }

        let bound = retry(&self.policy, move || storage.apply_claim(claim), Error::is_transient).await?;

        let original = self.snapshot.volume.reclaim_policy;
        retry(
            &self.policy,
            move || storage.set_reclaim_policy(volume_name, original),
            Error::is_transient,
        )
        .await?;
        Ok(bound)
    }

    /// Run the whole reuse protocol with the claim derived from the snapshot.
    ///
    /// Refuses, before changing anything, a volume holding another
    /// cluster's data.
    pub async fn reuse_volume(&mut self) -> Result<ClaimRecord> {
        if let Err(e) = self.snapshot.check_same_cluster() {
            warn!(volume = %self.snapshot.volume.name, error = %e, "Refusing to reuse volume");
            return Err(e);
        }
        let desired = self.snapshot.desired_claim();
        self.detach().await?;
        self.rebind(&desired).await
    }
}
