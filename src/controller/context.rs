//! Shared context for the controller.
//!
//! [`Context`] carries what the control loop shares with the REST API:
//! the membership registry, the WAL manager, the write gate, the
//! published member status and the dynamic settings. It also publishes
//! Kubernetes events on the member's Pod when a client is available.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

use super::error::Result;
use super::fencing::WriteGate;
use super::status::MemberStatus;
use crate::client::FIELD_MANAGER;
use crate::config::{DynamicSettings, SettingsPatch};
use crate::health::HealthState;
use crate::registry::MembershipRegistry;
use crate::wal::WalManager;

/// Shared context for the control loop and the API
pub struct Context {
    /// Kubernetes client, absent in simulations
    client: Option<Client>,
    /// Event reporter identity
    reporter: Reporter,
    /// The member's Pod, target of published events
    pod: ObjectReference,
    pub member_id: String,
    /// Address peers use to reach this member
    pub address: String,
    pub health_state: Arc<HealthState>,
    pub registry: RwLock<MembershipRegistry>,
    pub wal: RwLock<WalManager>,
    pub gate: WriteGate,
    blocked: AtomicBool,
    status: watch::Sender<MemberStatus>,
    settings: watch::Sender<DynamicSettings>,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Option<Client>,
        namespace: &str,
        registry: MembershipRegistry,
        wal: WalManager,
        address: &str,
        settings: DynamicSettings,
        health_state: Arc<HealthState>,
    ) -> Self {
        let member_id = registry.self_id().to_string();
        let pod = ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Pod".to_string()),
            name: Some(member_id.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        };
        health_state.set_liveness_window(settings.liveness_window());
        let (status, _) = watch::channel(MemberStatus::initial(&member_id, address));
        let (settings, _) = watch::channel(settings);
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: Some(member_id.clone()),
            },
            pod,
            member_id,
            address: address.to_string(),
            health_state,
            registry: RwLock::new(registry),
            wal: RwLock::new(wal),
            gate: WriteGate::new(),
            blocked: AtomicBool::new(false),
            status,
            settings,
        }
    }

    /// Latest published member status
    pub fn status(&self) -> MemberStatus {
        self.status.borrow().clone()
    }

    pub fn publish_status(&self, status: MemberStatus) {
        self.status.send_replace(status);
    }

    pub fn subscribe_status(&self) -> watch::Receiver<MemberStatus> {
        self.status.subscribe()
    }

    pub fn settings(&self) -> DynamicSettings {
        *self.settings.borrow()
    }

    pub fn subscribe_settings(&self) -> watch::Receiver<DynamicSettings> {
        self.settings.subscribe()
    }

    /// Validate and apply a settings patch. WAL retention changes at once;
    /// the control loop picks up timing changes on its next cycle.
    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<DynamicSettings> {
        // Holding the WAL lock serializes concurrent patches
        let mut wal = self.wal.write().await;
        let current = self.settings();
        let next = current.patched(patch)?;
        if next.wal_keep_segments != current.wal_keep_segments {
            let discarded = wal.set_keep_segments(next.wal_keep_segments);
            info!(
                keep_segments = next.wal_keep_segments,
                discarded = discarded.len(),
                "Changed WAL retention"
            );
        }
        self.health_state.set_liveness_window(next.liveness_window());
        self.settings.send_replace(next);
        Ok(next)
    }

    /// Whether automatic promotion is halted
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Clear a block. Returns whether the member was blocked.
    pub fn unblock(&self) -> bool {
        self.blocked.swap(false, Ordering::SeqCst)
    }

    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: Option<String>) {
        let Some(client) = &self.client else {
            debug!(reason = %reason, note = ?note, "Event (no Kubernetes client)");
            return;
        };
        let recorder = Recorder::new(client.clone(), self.reporter.clone());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &self.pod,
            )
            .await
        {
            warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Publish a normal event on the member's Pod
    pub async fn publish_normal_event(&self, reason: &str, action: &str, note: Option<String>) {
        self.publish(EventType::Normal, reason, action, note).await
    }

    /// Publish a warning event on the member's Pod
    pub async fn publish_warning_event(&self, reason: &str, action: &str, note: Option<String>) {
        self.publish(EventType::Warning, reason, action, note).await
    }
}
