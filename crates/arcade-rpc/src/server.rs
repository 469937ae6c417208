//! Control Plane RPC server (C11): an axum router exposing the agent
//! service methods as `POST /rpc/agent.v1.AgentService/<Method>` JSON
//! endpoints, with a tower layer stack mirroring the teacher's interceptor
//! chain (tag → logging → auth → panic recovery).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use sqlx::PgPool;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use arcade_core::auth::{AuthError, TokenVerifier};
use arcade_db::models::{AgentState, JobStatus};
use arcade_db::queries::{agents as agents_db, steps as steps_db};

use crate::proto::*;

/// RPC methods that never require a bearer token: registration has no
/// token yet, and the heartbeat path is hit so often it's exempted the
/// same way the teacher filters it out of verbose logging.
pub const EXCLUDED_AUTH_METHODS: &[&str] = &["Register"];

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn internal(err: anyhow::Error) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: format!("{err:#}") }
    }

    fn not_found(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    fn unauthorized(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::UNAUTHORIZED, message: msg.into() }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorEnvelope { error: self.message })).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub verifier: Arc<dyn TokenVerifier>,
    pub api_key: Vec<u8>,
}

pub fn build_router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/rpc/agent.v1.AgentService/Register", post(register))
        .route("/rpc/agent.v1.AgentService/Unregister", post(unregister))
        .route("/rpc/agent.v1.AgentService/Heartbeat", post(heartbeat))
        .route("/rpc/agent.v1.AgentService/FetchStepRun", post(fetch_step_run))
        .route(
            "/rpc/agent.v1.AgentService/ReportStepRunStatus",
            post(report_step_run_status),
        )
        .route("/rpc/agent.v1.AgentService/ReportStepRunLog", post(report_step_run_log))
        .route("/rpc/agent.v1.AgentService/CancelStepRun", post(cancel_step_run))
        .route("/rpc/agent.v1.AgentService/UpdateLabels", post(update_labels))
        .route("/rpc/agent.v1.AgentService/DownloadPlugin", post(download_plugin))
        .route(
            "/rpc/agent.v1.AgentService/ListAvailablePlugins",
            post(list_available_plugins),
        )
        // Legacy equivalents from the pre-pipeline task model: same
        // handlers, old names.
        .route("/rpc/agent.v1.AgentService/ReportTaskStatus", post(report_step_run_status))
        .route("/rpc/agent.v1.AgentService/ReportTaskLog", post(report_step_run_log))
        .route("/rpc/agent.v1.AgentService/CancelTask", post(cancel_step_run))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth_layer))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Checks the bearer token against `state.verifier`, skipping methods in
/// [`EXCLUDED_AUTH_METHODS`]. Runs before the handler, after tracing.
async fn auth_layer(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let method = req.uri().path().rsplit('/').next().unwrap_or_default();
    if EXCLUDED_AUTH_METHODS.contains(&method) {
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")));

    let Some(token) = token else {
        return AppError::unauthorized("missing bearer token").into_response();
    };

    if let Err(e) = state.verifier.verify(token).await {
        let message = match e {
            AuthError::Expired => "token expired",
            AuthError::NotYetValid => "token not yet valid",
            AuthError::UnknownAgent(_) => "unknown agent",
            _ => "invalid token",
        };
        return AppError::unauthorized(message).into_response();
    }

    next.run(req).await
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AppError> {
    let labels = serde_json::to_value(&req.labels).unwrap_or_default();
    let agent_id = Uuid::new_v4();
    let agent = agents_db::register_agent(&state.pool, agent_id, &req.hostname, &labels, req.max_concurrent_jobs)
        .await
        .map_err(AppError::internal)?;

    let token = arcade_core::auth::generate_permanent_token(&state.api_key, agent.id);
    Ok(Json(RegisterResponse { agent_id: agent.id, token }))
}

async fn unregister(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UnregisterRequest>,
) -> Result<Json<UnregisterResponse>, AppError> {
    agents_db::set_agent_state(&state.pool, req.agent_id, AgentState::Offline)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(UnregisterResponse {}))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let agent = agents_db::record_heartbeat(&state.pool, req.agent_id, req.running_jobs_count)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("agent {} not registered", req.agent_id)))?;

    arcade_core::metrics::record_heartbeat(&agent.id.to_string(), true);

    Ok(Json(HeartbeatResponse { labels: None, heartbeat_interval_secs: None }))
}

async fn fetch_step_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FetchStepRunRequest>,
) -> Result<Json<FetchStepRunResponse>, AppError> {
    let claimed = steps_db::claim_steps_for_agent(&state.pool, req.agent_id, req.max_step_runs)
        .await
        .map_err(AppError::internal)?;

    let step_runs = claimed
        .into_iter()
        .map(|s| StepRunDescriptor {
            step_run_id: s.id,
            job_id: s.job_id,
            name: s.name,
            action: s.action,
            params: s.params,
        })
        .collect();

    Ok(Json(FetchStepRunResponse { step_runs }))
}

async fn report_step_run_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReportStepRunStatusRequest>,
) -> Result<Json<ReportStepRunStatusResponse>, AppError> {
    let status: JobStatus = req
        .status
        .parse()
        .map_err(|_| AppError { status: StatusCode::BAD_REQUEST, message: format!("invalid status {:?}", req.status) })?;

    let existing = steps_db::get_step(&state.pool, req.step_run_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("step run {} not found", req.step_run_id)))?;

    // Idempotent: a terminal status re-delivered for an already-terminal
    // step run is a no-op success, not an error.
    if is_terminal(existing.status) {
        return Ok(Json(ReportStepRunStatusResponse { applied: false }));
    }

    steps_db::transition_step(&state.pool, req.step_run_id, status)
        .await
        .map_err(AppError::internal)?;

    if let Some(error) = req.error {
        tracing::warn!(step_run_id = %req.step_run_id, error, "step run reported failure");
    }

    Ok(Json(ReportStepRunStatusResponse { applied: true }))
}

fn is_terminal(status: JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
    )
}

async fn report_step_run_log(
    Json(req): Json<ReportStepRunLogRequest>,
) -> Json<ReportStepRunLogResponse> {
    tracing::info!(step_run_id = %req.step_run_id, agent_id = %req.agent_id, line = %req.line, "step run log");
    Json(ReportStepRunLogResponse {})
}

async fn cancel_step_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CancelStepRunRequest>,
) -> Result<Json<CancelStepRunResponse>, AppError> {
    let rows = steps_db::transition_step(&state.pool, req.step_run_id, JobStatus::Cancelled)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(CancelStepRunResponse { cancelled: rows > 0 }))
}

async fn update_labels(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateLabelsRequest>,
) -> Result<Json<UpdateLabelsResponse>, AppError> {
    let labels_json = serde_json::to_value(&req.labels).unwrap_or_default();
    let effective = agents_db::update_labels(&state.pool, req.agent_id, &labels_json, req.merge)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("agent {} not found", req.agent_id)))?;

    let labels: std::collections::HashMap<String, String> =
        serde_json::from_value(effective).unwrap_or_default();
    Ok(Json(UpdateLabelsResponse { labels }))
}

/// Static plugin bundles are out of scope; this always reports the
/// requested plugin unavailable rather than serving a blob.
async fn download_plugin(Json(req): Json<DownloadPluginRequest>) -> Json<DownloadPluginResponse> {
    tracing::debug!(plugin_id = %req.plugin_id, "plugin download requested, none configured");
    Json(DownloadPluginResponse { available: false, url: None })
}

async fn list_available_plugins(
    Json(_req): Json<ListAvailablePluginsRequest>,
) -> Json<ListAvailablePluginsResponse> {
    Json(ListAvailablePluginsResponse { plugin_ids: Vec::new() })
}

pub async fn serve(pool: PgPool, state: AppState, bind: &str, port: u16, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    let _ = &pool;
    let app = build_router(state);
    let addr: std::net::SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("rpc server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    tracing::info!("rpc server shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcade_core::auth::InMemoryVerifier;
    use arcade_test_utils::{create_test_db, drop_test_db};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn test_state(pool: PgPool) -> AppState {
        let api_key = b"test-api-key".to_vec();
        AppState {
            pool,
            verifier: Arc::new(InMemoryVerifier::new(vec![api_key.clone()])),
            api_key,
        }
    }

    async fn post_json(router: Router, path: &str, body: serde_json::Value, token: Option<&str>) -> Response {
        let mut builder = HttpRequest::builder().method("POST").uri(path).header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let req = builder.body(Body::from(serde_json::to_vec(&body).unwrap())).unwrap();
        router.oneshot(req).await.unwrap()
    }

    #[tokio::test]
    async fn register_does_not_require_auth() {
        let (pool, db_name) = create_test_db().await;
        let router = build_router(test_state(pool.clone()));

        let resp = post_json(
            router,
            "/rpc/agent.v1.AgentService/Register",
            serde_json::json!({
                "api_key": "k", "hostname": "worker-1", "local_ip": "10.0.0.1",
                "os": "linux", "arch": "amd64", "agent_version": "0.1.0",
                "max_concurrent_jobs": 4
            }),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn heartbeat_requires_auth() {
        let (pool, db_name) = create_test_db().await;
        let router = build_router(test_state(pool.clone()));

        let resp = post_json(
            router,
            "/rpc/agent.v1.AgentService/Heartbeat",
            serde_json::json!({
                "agent_id": Uuid::new_v4(), "agent_name": "a", "status": "ONLINE",
                "running_jobs_count": 0, "timestamp": chrono::Utc::now()
            }),
            None,
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn heartbeat_succeeds_with_valid_token() {
        let (pool, db_name) = create_test_db().await;
        let agent = agents_db::register_agent(&pool, Uuid::new_v4(), "worker-2", &serde_json::json!({}), 1)
            .await
            .unwrap();
        let token = arcade_core::auth::generate_permanent_token(b"test-api-key", agent.id);
        let router = build_router(test_state(pool.clone()));

        let resp = post_json(
            router,
            "/rpc/agent.v1.AgentService/Heartbeat",
            serde_json::json!({
                "agent_id": agent.id, "agent_name": "worker-2", "status": "ONLINE",
                "running_jobs_count": 1, "timestamp": chrono::Utc::now()
            }),
            Some(&token),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn list_available_plugins_returns_empty_set() {
        let (pool, db_name) = create_test_db().await;
        let agent = agents_db::register_agent(&pool, Uuid::new_v4(), "worker-3", &serde_json::json!({}), 1)
            .await
            .unwrap();
        let token = arcade_core::auth::generate_permanent_token(b"test-api-key", agent.id);
        let router = build_router(test_state(pool.clone()));

        let resp = post_json(
            router,
            "/rpc/agent.v1.AgentService/ListAvailablePlugins",
            serde_json::json!({}),
            Some(&token),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
