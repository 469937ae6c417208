//! Scoped external surface (C15): a second axum router, separate from the
//! agent RPC surface, exposing only `/health`, `/version`, `/shutdown`,
//! `/metrics`, and a stubbed `/debug/pprof/*` tree. Every error response
//! uses the admin envelope the teacher's operator-facing CLI output
//! mirrors: `{code, msg, detail, request_id, path}`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use uuid::Uuid;

use arcade_core::lifecycle::ShutdownFlag;

#[derive(Clone)]
pub struct AdminState {
    pub shutdown: ShutdownFlag,
    pub metrics: PrometheusHandle,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
struct Envelope {
    code: u16,
    msg: String,
    detail: Option<String>,
    request_id: String,
    path: String,
}

impl Envelope {
    fn new(code: StatusCode, msg: impl Into<String>, path: &str) -> Self {
        Self {
            code: code.as_u16(),
            msg: msg.into(),
            detail: None,
            request_id: Uuid::new_v4().to_string(),
            path: path.to_string(),
        }
    }
}

pub fn build_router(state: AdminState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/shutdown", post(shutdown))
        .route("/metrics", get(metrics))
        .route("/debug/pprof/{*profile}", get(pprof_stub))
        .with_state(state)
}

async fn health(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    if state.shutdown.is_shutting_down() {
        let env = Envelope::new(StatusCode::SERVICE_UNAVAILABLE, "shutting down", "/health");
        (StatusCode::SERVICE_UNAVAILABLE, Json(env)).into_response()
    } else {
        StatusCode::OK.into_response()
    }
}

async fn version(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "version": state.version }))
}

/// Triggers the graceful shutdown sequence. Idempotent: a second call
/// after one already triggered still returns 200.
async fn shutdown(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    state.shutdown.trigger();
    StatusCode::OK
}

async fn metrics(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    state.metrics.render()
}

/// Not implemented: the teacher's pack has no profiling endpoint to model
/// this on, so it's wired but returns 501 with the admin envelope rather
/// than 404, so operators can tell "not built yet" from "wrong path".
async fn pprof_stub(Path(profile): Path<String>) -> impl IntoResponse {
    let path = format!("/debug/pprof/{profile}");
    let mut env = Envelope::new(StatusCode::NOT_IMPLEMENTED, "profiling not implemented", &path);
    env.detail = Some(format!("profile {profile:?} requested"));
    (StatusCode::NOT_IMPLEMENTED, Json(env))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AdminState {
        AdminState {
            shutdown: ShutdownFlag::new(),
            metrics: arcade_core::metrics::install_recorder().expect("install recorder"),
            version: "test",
        }
    }

    #[tokio::test]
    async fn health_reports_ok_before_shutdown() {
        let router = build_router(test_state());
        let res = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn shutdown_then_health_reports_unavailable() {
        let state = test_state();
        let flag = state.shutdown.clone();
        let router = build_router(state);

        let res = router
            .clone()
            .oneshot(Request::builder().method("POST").uri("/shutdown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(flag.is_shutting_down());

        let res = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn pprof_stub_returns_501() {
        let router = build_router(test_state());
        let res = router
            .oneshot(Request::builder().uri("/debug/pprof/heap").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_IMPLEMENTED);
    }
}
