//! In-memory storage platform.
//!
//! Models volumes, claims, mounts and the reclaim behavior of the platform:
//! deleting a claim whose volume has the `Delete` policy destroys the volume
//! and its contents. Each volume carries a list of data rows so tests can
//! show that data survives a reattachment.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ClaimRecord, ClaimReference, Orchestrator, ReclaimPolicy, StorageApi, VolumeRecord};
use crate::controller::error::{Error, Result};

type ClaimKey = (String, String);

#[derive(Debug, Default)]
struct Inner {
    volumes: BTreeMap<String, VolumeRecord>,
    claims: BTreeMap<ClaimKey, ClaimRecord>,
    contents: HashMap<String, Vec<String>>,
    mounts: HashSet<ClaimKey>,
    /// Application name to the claims of its ordinals, in order.
    applications: HashMap<String, Vec<ClaimKey>>,
    failures: HashSet<&'static str>,
    next_uid: u64,
}

impl Inner {
    fn uid(&mut self) -> String {
        self.next_uid += 1;
        format!("uid-{}", self.next_uid)
    }

    fn check_fault(&mut self, op: &'static str) -> Result<()> {
        if self.failures.remove(op) {
            return Err(Error::BackendUnreachable(format!("injected failure in {}", op)));
        }
        Ok(())
    }
}

/// Storage and orchestration platform held in memory.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision a volume bound to a new claim, as a StatefulSet would.
    pub async fn provision(&self, namespace: &str, claim: &str, volume: &str, policy: ReclaimPolicy) {
        let mut inner = self.inner.lock().await;
        let claim_uid = inner.uid();
        let volume_uid = inner.uid();
        let mut annotations = BTreeMap::new();
        annotations.insert("pv.kubernetes.io/bind-completed".to_string(), "yes".to_string());
        inner.claims.insert(
            (namespace.to_string(), claim.to_string()),
            ClaimRecord {
                name: claim.to_string(),
                namespace: namespace.to_string(),
                uid: Some(claim_uid.clone()),
                resource_version: Some("1".to_string()),
                annotations,
                volume_name: Some(volume.to_string()),
                access_modes: vec!["ReadWriteOnce".to_string()],
                storage_request: Some("1Gi".to_string()),
                ..Default::default()
            },
        );
        inner.volumes.insert(
            volume.to_string(),
            VolumeRecord {
                name: volume.to_string(),
                uid: Some(volume_uid),
                reclaim_policy: policy,
                claim_ref: Some(ClaimReference {
                    namespace: namespace.to_string(),
                    name: claim.to_string(),
                    uid: Some(claim_uid),
                }),
                host_path: Some(format!("/var/lib/volumes/{}", volume)),
            },
        );
        inner.contents.entry(volume.to_string()).or_default();
    }

    /// Set a label on an existing claim.
    pub async fn label_claim(&self, namespace: &str, claim: &str, key: &str, value: &str) {
        if let Some(record) = self
            .inner
            .lock()
            .await
            .claims
            .get_mut(&(namespace.to_string(), claim.to_string()))
        {
            record.labels.insert(key.to_string(), value.to_string());
        }
    }

    /// Declare an application whose ordinal `i` uses `claims[i]`.
    pub async fn register_application(&self, name: &str, namespace: &str, claims: &[&str]) {
        let keys = claims
            .iter()
            .map(|c| (namespace.to_string(), c.to_string()))
            .collect();
        self.inner.lock().await.applications.insert(name.to_string(), keys);
    }

    /// Append a data row to a volume.
    pub async fn write_data(&self, volume: &str, row: &str) {
        self.inner
            .lock()
            .await
            .contents
            .entry(volume.to_string())
            .or_default()
            .push(row.to_string());
    }

    /// Rows on the volume currently bound to a claim.
    pub async fn read_claim_data(&self, namespace: &str, claim: &str) -> Option<Vec<String>> {
        let inner = self.inner.lock().await;
        let record = inner.claims.get(&(namespace.to_string(), claim.to_string()))?;
        let volume = record.volume_name.as_ref()?;
        inner.contents.get(volume).cloned()
    }

    pub async fn volume_exists(&self, volume: &str) -> bool {
        self.inner.lock().await.volumes.contains_key(volume)
    }

    /// Make the next call of `op` fail with `BackendUnreachable`.
    pub async fn inject_failure(&self, op: &'static str) {
        self.inner.lock().await.failures.insert(op);
    }

    /// Mark a claim as mounted by a running pod.
    pub async fn mount(&self, namespace: &str, claim: &str) {
        self.inner
            .lock()
            .await
            .mounts
            .insert((namespace.to_string(), claim.to_string()));
    }
}

#[async_trait]
impl StorageApi for InMemoryStorage {
    async fn get_volume(&self, name: &str) -> Result<Option<VolumeRecord>> {
        let mut inner = self.inner.lock().await;
        inner.check_fault("get_volume")?;
        Ok(inner.volumes.get(name).cloned())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimRecord>> {
        let mut inner = self.inner.lock().await;
        inner.check_fault("get_claim")?;
        Ok(inner
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn set_reclaim_policy(&self, volume: &str, policy: ReclaimPolicy) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_fault("set_reclaim_policy")?;
        let record = inner
            .volumes
            .get_mut(volume)
            .ok_or_else(|| Error::MissingField(format!("persistent volume {}", volume)))?;
        record.reclaim_policy = policy;
        Ok(())
    }

    async fn clear_claim_ref(&self, volume: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_fault("clear_claim_ref")?;
        let record = inner
            .volumes
            .get_mut(volume)
            .ok_or_else(|| Error::MissingField(format!("persistent volume {}", volume)))?;
        record.claim_ref = None;
        Ok(())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_fault("delete_claim")?;
        let key = (namespace.to_string(), name.to_string());
        let Some(claim) = inner.claims.remove(&key) else {
            return Ok(());
        };
        inner.mounts.remove(&key);

        // The platform reclaims the bound volume according to its policy
        if let Some(volume) = claim.volume_name
            && let Some(record) = inner.volumes.get(&volume).cloned()
            && record.claim_ref.as_ref().is_some_and(|r| r.name == name && r.namespace == namespace)
        {
            if record.reclaim_policy == ReclaimPolicy::Delete {
                debug!(volume = %volume, "Reclaiming volume after claim deletion");
                inner.volumes.remove(&volume);
                inner.contents.remove(&volume);
            }
            // Retained volumes go to Released and keep their claimRef
        }
        Ok(())
    }

    async fn apply_claim(&self, claim: &ClaimRecord) -> Result<ClaimRecord> {
        let mut inner = self.inner.lock().await;
        inner.check_fault("apply_claim")?;
        let key = (claim.namespace.clone(), claim.name.clone());

        if let Some(existing) = inner.claims.get(&key).cloned() {
            if existing.volume_name != claim.volume_name {
                return Err(Error::NameConflict(format!(
                    "claim {}/{} is bound to {:?}",
                    claim.namespace, claim.name, existing.volume_name
                )));
            }
            let mut updated = existing;
            updated.labels = claim.labels.clone();
            for (k, v) in &claim.annotations {
                updated.annotations.insert(k.clone(), v.clone());
            }
            inner.claims.insert(key, updated.clone());
            return Ok(updated);
        }

        let uid = inner.uid();
        let mut stored = claim.clone();
        stored.uid = Some(uid.clone());
        stored.resource_version = Some("1".to_string());

        if let Some(volume) = &claim.volume_name {
            let record = inner
                .volumes
                .get_mut(volume)
                .ok_or_else(|| Error::MissingField(format!("persistent volume {}", volume)))?;
            if let Some(r) = &record.claim_ref
                && (r.name != claim.name || r.namespace != claim.namespace)
            {
                return Err(Error::NameConflict(format!(
                    "volume {} is claimed by {}/{}",
                    volume, r.namespace, r.name
                )));
            }
            record.claim_ref = Some(ClaimReference {
                namespace: claim.namespace.clone(),
                name: claim.name.clone(),
                uid: Some(uid),
            });
            stored
                .annotations
                .insert("pv.kubernetes.io/bind-completed".to_string(), "yes".to_string());
        }
        inner.claims.insert(key, stored.clone());
        Ok(stored)
    }

    async fn is_mounted(&self, namespace: &str, claim: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.check_fault("is_mounted")?;
        Ok(inner
            .mounts
            .contains(&(namespace.to_string(), claim.to_string())))
    }
}

#[async_trait]
impl Orchestrator for InMemoryStorage {
    async fn remove_application(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_fault("remove_application")?;
        if let Some(claims) = inner.applications.remove(name) {
            for key in claims {
                inner.mounts.remove(&key);
            }
        }
        Ok(())
    }

    async fn scale(&self, name: &str, replicas: i32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_fault("scale")?;
        let claims = inner
            .applications
            .get(name)
            .cloned()
            .ok_or_else(|| Error::MissingField(format!("application {}", name)))?;
        let replicas = usize::try_from(replicas.max(0)).unwrap_or(0);
        for (ordinal, key) in claims.into_iter().enumerate() {
            if ordinal < replicas && inner.claims.contains_key(&key) {
                inner.mounts.insert(key);
            } else {
                inner.mounts.remove(&key);
            }
        }
        Ok(())
    }
}
