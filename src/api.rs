//! Registry API: the tenant-facing REST surface, plus the single admin
//! status endpoint and the unauthenticated health probe.
//!
//! Grounded on the teacher's CLI/config split in spirit only — the teacher
//! has no HTTP surface of its own, so the router/error-envelope shape here
//! follows the REST conventions common across the example pack (error
//! object with `code`/`message`/`details`, bearer auth resolved per
//! request rather than via a blanket `tower` layer, since the scope a
//! token resolves to differs per route).

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, patch, post};
use serde::Serialize;
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::alert::{AlertSink, EscalationClient};
use crate::artifact::ArtifactStore;
use crate::config::{AuthConfig, HeartbeatConfig, StoreConfig};
use crate::store::Store;

pub struct AppState {
    pub store: Store,
    pub artifacts: ArtifactStore,
    pub alert: Arc<dyn AlertSink>,
    pub escalation: Option<Arc<EscalationClient>>,
    pub auth: AuthConfig,
    pub max_source_bytes: usize,
    /// `slowest_N` size for `GET /api/v1/status/summary`; shares the
    /// heartbeat config's `slowest_n` rather than introducing a second knob.
    pub status_slowest_n: i64,
}

impl AppState {
    pub fn new(
        store: Store,
        artifacts: ArtifactStore,
        alert: Arc<dyn AlertSink>,
        escalation: Option<Arc<EscalationClient>>,
        auth: AuthConfig,
        store_config: &StoreConfig,
        heartbeat_config: &HeartbeatConfig,
    ) -> Self {
        Self {
            store,
            artifacts,
            alert,
            escalation,
            auth,
            max_source_bytes: store_config.max_source_bytes,
            status_slowest_n: heartbeat_config.slowest_n as i64,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/tests/upload", post(handlers::upload_test))
        .route("/api/v1/tests", get(handlers::list_tests))
        .route("/api/v1/tests/{id}", get(handlers::get_test).patch(handlers::patch_test))
        .route("/api/v1/tests/{id}/source", post(handlers::replace_source))
        .route("/api/v1/tests/{id}/disable", post(handlers::disable_test))
        .route("/api/v1/tests/{id}/enable", post(handlers::enable_test))
        .route("/api/v1/tests/{id}/run", post(handlers::trigger_run))
        .route("/api/v1/tests/{id}/runs", get(handlers::list_runs))
        .route("/api/v1/runs/{id}", get(handlers::get_run))
        .route("/api/v1/runs/{id}/artifacts/{name}", get(handlers::get_artifact))
        .route("/api/v1/status/summary", get(handlers::status_summary))
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The `{"error":{"code","message","details":{}}}` envelope (spec §6).
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorCode {
    InvalidRequest,
    Unauthorized,
    NotFound,
    RateLimited,
    RunnerUnavailable,
    Internal,
}

impl ApiErrorCode {
    fn http_status(self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            ApiErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiErrorCode::RunnerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::InvalidRequest, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(ApiErrorCode::Unauthorized, "missing or invalid bearer token")
    }

    pub fn not_found() -> Self {
        Self::new(ApiErrorCode::NotFound, "resource not found")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Internal, message)
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.code.http_status();
        let body = serde_json::json!({ "error": self });
        (status, axum::Json(body)).into_response()
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(e: crate::store::StoreError) -> Self {
        match e {
            crate::store::StoreError::NotFound => ApiError::not_found(),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<crate::artifact::ArtifactError> for ApiError {
    fn from(e: crate::artifact::ArtifactError) -> Self {
        ApiError::internal(e.to_string())
    }
}
