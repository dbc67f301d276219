//! Health probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (503 once the control loop stops ticking)
//! - `/readyz` - Readiness probe (200 after the first completed cycle)
//! - `/metrics` - Prometheus metrics endpoint
//!
//! These routes are merged into the member's REST API router.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use jiff::Timestamp;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;

use crate::registry::Role;

/// Labels for outcome-based metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct OutcomeLabels {
    pub outcome: String,
}

impl EncodeLabelSet for OutcomeLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for the role gauge
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct RoleLabels {
    pub role: String,
}

impl EncodeLabelSet for RoleLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("role", self.role.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Supervisor metrics
pub struct Metrics {
    /// Completed control loop cycles
    pub loop_cycles: Counter,
    /// Control loop cycle duration
    pub loop_duration_seconds: Histogram,
    /// Elections by outcome (won, lost, unreachable)
    pub elections: Family<OutcomeLabels, Counter>,
    /// Promotions of this member
    pub failovers: Counter,
    /// 1 for the member's current role, 0 otherwise
    pub role: Family<RoleLabels, Gauge>,
    pub lease_renew_failures: Counter,
    pub wal_segments_retained: Gauge,
    /// Volume reattachments by outcome
    pub reattachments: Family<OutcomeLabels, Counter>,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let loop_cycles = Counter::default();
        registry.register(
            "pgha_loop_cycles",
            "Total number of control loop cycles",
            loop_cycles.clone(),
        );

        let loop_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 15));
        registry.register(
            "pgha_loop_duration_seconds",
            "Duration of a control loop cycle in seconds",
            loop_duration_seconds.clone(),
        );

        let elections = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "pgha_elections",
            "Leader elections attempted by this member, by outcome",
            elections.clone(),
        );

        let failovers = Counter::default();
        registry.register(
            "pgha_failovers",
            "Number of times this member was promoted",
            failovers.clone(),
        );

        let role = Family::<RoleLabels, Gauge>::default();
        registry.register("pgha_role", "Current role of this member", role.clone());

        let lease_renew_failures = Counter::default();
        registry.register(
            "pgha_lease_renew_failures",
            "Failed renewals of the leader lease",
            lease_renew_failures.clone(),
        );

        let wal_segments_retained = Gauge::default();
        registry.register(
            "pgha_wal_segments_retained",
            "WAL segments currently retained",
            wal_segments_retained.clone(),
        );

        let reattachments = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "pgha_reattachments",
            "Persistent volume reattachments, by outcome",
            reattachments.clone(),
        );

        Self {
            loop_cycles,
            loop_duration_seconds,
            elections,
            failovers,
            role,
            lease_renew_failures,
            wal_segments_retained,
            reattachments,
            registry,
        }
    }

    /// Record a completed control loop cycle
    pub fn record_cycle(&self, duration_secs: f64) {
        self.loop_cycles.inc();
        self.loop_duration_seconds.observe(duration_secs);
    }

    pub fn record_election(&self, outcome: &str) {
        self.elections
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn record_reattachment(&self, outcome: &str) {
        self.reattachments
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    /// Set the role gauge so exactly one role reads 1
    pub fn set_role(&self, current: Role) {
        for role in [Role::Primary, Role::Replica, Role::Unknown] {
            let labels = RoleLabels {
                role: role.to_string(),
            };
            self.role
                .get_or_create(&labels)
                .set(i64::from(role == current));
        }
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health probes
pub struct HealthState {
    /// Whether the first control loop cycle completed
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last completed cycle (Unix epoch seconds, 0 before the first one)
    pub last_cycle: AtomicU64,
    /// Process start (Unix epoch seconds)
    started_at: AtomicU64,
    /// Maximum age of the last cycle for the liveness probe, in seconds
    liveness_window: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

fn epoch_secs() -> u64 {
    u64::try_from(Timestamp::now().as_second()).unwrap_or(0)
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_cycle: AtomicU64::new(0),
            started_at: AtomicU64::new(epoch_secs()),
            liveness_window: AtomicU64::new(30),
        }
    }

    /// Mark the supervisor as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the supervisor is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Record that the control loop completed a cycle
    pub fn record_cycle(&self) {
        self.last_cycle.store(epoch_secs(), Ordering::SeqCst);
    }

    /// Liveness fails when no cycle completed within `window`.
    pub fn set_liveness_window(&self, window: Duration) {
        self.liveness_window
            .store(window.as_secs().max(1), Ordering::SeqCst);
    }

    /// Whether the control loop ticked recently (startup counts as a tick).
    pub fn is_live(&self) -> bool {
        let last = self
            .last_cycle
            .load(Ordering::SeqCst)
            .max(self.started_at.load(Ordering::SeqCst));
        epoch_secs().saturating_sub(last) <= self.liveness_window.load(Ordering::SeqCst)
    }
}

/// Liveness probe handler
///
/// Returns 503 when the control loop has stalled.
async fn healthz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_live() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "control loop stalled").into_response()
    }
}

/// Readiness probe handler
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health probe router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
