//! Member REST API.
//!
//! Serves this member's status to its peers, the cluster view to
//! operators, role probes for Kubernetes Services, dynamic settings and
//! the operator actions (WAL switch, unblock). The health probes and
//! metrics from [`crate::health`] are merged into the same router.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::client::AdminChannel;
use crate::config::SettingsPatch;
use crate::controller::error::Error;
use crate::controller::{ClusterStatus, Context, MemberState};
use crate::health;
use crate::registry::MemberView;

/// State shared by the API handlers
#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<Context>,
    pub admin: Arc<dyn AdminChannel>,
}

/// Error returned by API handlers
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self.0 {
            Error::DataGap {
                required_from,
                oldest_retained,
            } => {
                return (
                    StatusCode::CONFLICT,
                    Json(json!({
                        "error": self.0.to_string(),
                        "required_from": required_from,
                        "oldest_retained": oldest_retained,
                    })),
                )
                    .into_response();
            }
            e => json!({ "error": e.to_string() }),
        };
        let status = match &self.0 {
            Error::Validation(_) | Error::RetentionRegression { .. } => StatusCode::BAD_REQUEST,
            Error::LeaseHeld { .. } | Error::LeaseExpired(_) => StatusCode::CONFLICT,
            Error::BackendUnreachable(_) | Error::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(body)).into_response()
    }
}

/// Body of `GET /cluster`
#[derive(Debug, Serialize)]
struct ClusterView {
    status: ClusterStatus,
    primary: Option<String>,
    members: Vec<MemberView>,
}

#[derive(Debug, Deserialize)]
struct SegmentsQuery {
    since: Option<u64>,
}

async fn member(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.ctx.status())
}

async fn cluster(State(state): State<ApiState>) -> impl IntoResponse {
    let registry = state.ctx.registry.read().await;
    let primary = registry.primary().map(|p| p.id.clone());
    Json(ClusterView {
        status: ClusterStatus::evaluate(state.ctx.is_blocked(), primary.as_deref()),
        primary,
        members: registry.snapshot(Instant::now()),
    })
}

/// 200 only on the primary with the write gate open
async fn primary(State(state): State<ApiState>) -> Response {
    let status = state.ctx.status();
    if status.is_primary() && state.ctx.gate.is_open() {
        (StatusCode::OK, Json(status)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(status)).into_response()
    }
}

async fn replica(State(state): State<ApiState>) -> Response {
    let status = state.ctx.status();
    if status.state == MemberState::Replica {
        (StatusCode::OK, Json(status)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(status)).into_response()
    }
}

async fn wal_segments(
    State(state): State<ApiState>,
    Query(query): Query<SegmentsQuery>,
) -> Result<Response, ApiError> {
    let segments = state.ctx.wal.read().await.catch_up_from(query.since)?;
    Ok(Json(segments).into_response())
}

async fn get_config(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.ctx.settings())
}

async fn patch_config(
    State(state): State<ApiState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Response, ApiError> {
    let settings = state.ctx.update_settings(&patch).await?;
    info!(
        loop_wait = settings.loop_wait,
        ttl = settings.ttl,
        retry_timeout = settings.retry_timeout,
        wal_keep_segments = settings.wal_keep_segments,
        "Settings updated through the API"
    );
    Ok(Json(settings).into_response())
}

/// Force a WAL switch and checkpoint on the primary.
async fn switch_wal(State(state): State<ApiState>) -> Result<Response, ApiError> {
    if !state.ctx.gate.is_open() {
        return Ok((
            StatusCode::CONFLICT,
            Json(json!({ "error": "not the primary" })),
        )
            .into_response());
    }
    let closed = state.admin.switch_wal().await?;
    state.admin.checkpoint().await?;
    let mut wal = state.ctx.wal.write().await;
    wal.sync_to(closed + 1)?;
    let current = wal.current_segment();
    info!(closed, current, "WAL switched through the API");
    Ok(Json(json!({ "closed": closed, "current": current })).into_response())
}

async fn unblock(State(state): State<ApiState>) -> impl IntoResponse {
    let was_blocked = state.ctx.unblock();
    if was_blocked {
        warn!(member = %state.ctx.member_id, "Block cleared by operator");
        state
            .ctx
            .publish_normal_event("Unblocked", "Unblock", None)
            .await;
    }
    Json(json!({ "unblocked": was_blocked }))
}

/// Create the API router, including health probes and metrics
pub fn create_router(state: ApiState) -> Router {
    let health = health::create_router(state.ctx.health_state.clone());
    Router::new()
        .route("/member", get(member))
        .route("/cluster", get(cluster))
        .route("/primary", get(primary))
        .route("/replica", get(replica))
        .route("/wal/segments", get(wal_segments))
        .route("/config", get(get_config).patch(patch_config))
        .route("/switch-wal", post(switch_wal))
        .route("/unblock", post(unblock))
        .with_state(state)
        .merge(health)
}

/// Serve the API until `shutdown` fires.
pub async fn run_api_server(
    state: ApiState,
    address: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let app = create_router(state);
    info!(address = %address, "Starting REST API server");

    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    Ok(())
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
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::DynamicSettings;
    use crate::controller::error::Result;
    use crate::health::HealthState;
    use crate::registry::MembershipRegistry;
    use crate::wal::WalManager;

    struct FakeAdmin(AtomicU64);

    #[async_trait]
    impl AdminChannel for FakeAdmin {
        async fn switch_wal(&self) -> Result<u64> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst))
        }

        async fn checkpoint(&self) -> Result<()> {
            Ok(())
        }

        async fn current_segment(&self) -> Result<u64> {
            Ok(self.0.load(Ordering::SeqCst))
        }

        async fn replayed_segment(&self) -> Result<Option<u64>> {
            Ok(None)
        }

        async fn is_ready(&self) -> bool {
            true
        }
    }

    fn state() -> ApiState {
        let mut wal = WalManager::starting_at(1, 1, 2);
        wal.sync_to(10).unwrap();
        let ctx = Arc::new(Context::new(
            None,
            "default",
            MembershipRegistry::new("pg-0", "pg-0:8008", &[]),
            wal,
            "pg-0:8008",
            DynamicSettings::default(),
            Arc::new(HealthState::new()),
        ));
        ApiState {
            ctx,
            admin: Arc::new(FakeAdmin(AtomicU64::new(10))),
        }
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_member_and_cluster_views() {
        let app = create_router(state());
        let (status, body) = call(app.clone(), Request::get("/member").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "pg-0");

        let (status, body) = call(app, Request::get("/cluster").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "no primary, electing");
        assert_eq!(body["members"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_role_probes() {
        let app = create_router(state());
        let (status, _) = call(app.clone(), Request::get("/primary").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = call(app, Request::get("/replica").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_wal_segments_and_data_gap() {
        let app = create_router(state());
        let (status, body) = call(
            app.clone(),
            Request::get("/wal/segments?since=8").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let numbers: Vec<u64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["sequence_number"].as_u64().unwrap())
            .collect();
        assert_eq!(numbers, vec![9, 10]);

        let (status, body) = call(
            app.clone(),
            Request::get("/wal/segments?since=2").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["required_from"], 3);
        assert_eq!(body["oldest_retained"], 8);

        let (status, _) = call(
            app,
            Request::get("/wal/segments?since=18446744073709551615")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_patch_config_validates() {
        let state = state();
        let app = create_router(state.clone());
        let (status, body) = call(
            app.clone(),
            Request::patch("/config")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"ttl": 40}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ttl"], 40);

        for rejected in [
            r#"{"ttl": 5}"#,
            r#"{"ttl": 18446744073709551615}"#,
            r#"{"loop_wait": 9223372036854775808}"#,
        ] {
            let (status, _) = call(
                app.clone(),
                Request::patch("/config")
                    .header("content-type", "application/json")
                    .body(Body::from(rejected))
                    .unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", rejected);
        }
        assert_eq!(state.ctx.settings().ttl, 40);

        // Retention changes reach the WAL manager right away
        let (status, body) = call(
            app,
            Request::patch("/config")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"wal_keep_segments": 0}"#))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["wal_keep_segments"], 0);
        assert_eq!(state.ctx.wal.read().await.oldest_retained(), Some(10));
    }

    #[tokio::test]
    async fn test_switch_wal_requires_open_gate() {
        let state = state();
        let app = create_router(state.clone());
        let (status, _) = call(app.clone(), Request::post("/switch-wal").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        state
            .ctx
            .gate
            .open(1, Instant::now() + std::time::Duration::from_secs(30));
        let (status, body) = call(app, Request::post("/switch-wal").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["closed"], 10);
        assert_eq!(body["current"], 11);
    }

    #[tokio::test]
    async fn test_unblock() {
        let state = state();
        state.ctx.set_blocked(true);
        let app = create_router(state.clone());
        let (_, body) = call(app, Request::post("/unblock").body(Body::empty()).unwrap()).await;
        assert_eq!(body["unblocked"], true);
        assert!(!state.ctx.is_blocked());
    }
}
