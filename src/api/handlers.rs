//! Route handlers. Each one authenticates first via [`super::auth::authenticate`],
//! then does the minimum validation the spec calls out before touching the
//! store, so a bad request never reaches a write.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::response::IntoResponse;
use axum::{Json, http};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::{AuthScope, authenticate};
use super::{ApiError, AppState};
use crate::model::{Run, Test, TestKind};

type St = State<Arc<AppState>>;

fn validate_schedule(
    interval_seconds: i64,
    timeout_seconds: i64,
    jitter_seconds: i64,
    down_after_failures: i64,
    up_after_successes: i64,
) -> Result<(), ApiError> {
    if !(Test::MIN_INTERVAL_SECONDS..=Test::MAX_INTERVAL_SECONDS).contains(&interval_seconds) {
        return Err(ApiError::invalid_request(format!(
            "interval_seconds must be between {} and {}",
            Test::MIN_INTERVAL_SECONDS,
            Test::MAX_INTERVAL_SECONDS
        )));
    }
    if !(Test::MIN_TIMEOUT_SECONDS..=Test::MAX_TIMEOUT_SECONDS).contains(&timeout_seconds) {
        return Err(ApiError::invalid_request(format!(
            "timeout_seconds must be between {} and {}",
            Test::MIN_TIMEOUT_SECONDS,
            Test::MAX_TIMEOUT_SECONDS
        )));
    }
    if !(0..=interval_seconds).contains(&jitter_seconds) {
        return Err(ApiError::invalid_request(format!(
            "jitter_seconds must be between 0 and interval_seconds ({interval_seconds})"
        )));
    }
    if down_after_failures < 1 {
        return Err(ApiError::invalid_request("down_after_failures must be at least 1"));
    }
    if up_after_successes < 1 {
        return Err(ApiError::invalid_request("up_after_successes must be at least 1"));
    }
    Ok(())
}

fn parse_kind(raw: &str) -> Result<TestKind, ApiError> {
    match raw {
        "script_python" => Ok(TestKind::ScriptPython),
        "script_js" => Ok(TestKind::ScriptJs),
        other => Err(ApiError::invalid_request(format!("unsupported test kind '{other}'"))),
    }
}

fn parse_i64_field(name: &str, raw: &str) -> Result<i64, ApiError> {
    raw.parse().map_err(|_| ApiError::invalid_request(format!("'{name}' must be an integer")))
}

/// One multipart upload, disassembled field-by-field. Axum's `Multipart` is
/// a stream, not a struct extractor, so every handler that accepts a file
/// walks it by hand.
struct TestUpload {
    name: Option<String>,
    base_url: Option<String>,
    kind: Option<String>,
    interval_seconds: Option<String>,
    timeout_seconds: Option<String>,
    jitter_seconds: Option<String>,
    down_after_failures: Option<String>,
    up_after_successes: Option<String>,
    source: Option<Vec<u8>>,
}

async fn drain_multipart(mut multipart: Multipart) -> Result<TestUpload, ApiError> {
    let mut upload = TestUpload {
        name: None,
        base_url: None,
        kind: None,
        interval_seconds: None,
        timeout_seconds: None,
        jitter_seconds: None,
        down_after_failures: None,
        up_after_successes: None,
        source: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::invalid_request(format!("malformed multipart body: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "source" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::invalid_request(format!("failed to read upload: {e}")))?;
                upload.source = Some(bytes.to_vec());
            }
            other => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::invalid_request(format!("failed to read field '{other}': {e}")))?;
                match other {
                    "name" => upload.name = Some(text),
                    "base_url" => upload.base_url = Some(text),
                    "kind" => upload.kind = Some(text),
                    "interval_seconds" => upload.interval_seconds = Some(text),
                    "timeout_seconds" => upload.timeout_seconds = Some(text),
                    "jitter_seconds" => upload.jitter_seconds = Some(text),
                    "down_after_failures" => upload.down_after_failures = Some(text),
                    "up_after_successes" => upload.up_after_successes = Some(text),
                    _ => {}
                }
            }
        }
    }
    Ok(upload)
}

fn require_field<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, ApiError> {
    value.as_deref().ok_or_else(|| ApiError::invalid_request(format!("missing required field '{name}'")))
}

pub async fn upload_test(
    State(state): St,
    headers: http::HeaderMap,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = authenticate(&state, &headers).await?.require_tenant()?;
    let upload = drain_multipart(multipart).await?;

    let name = require_field(&upload.name, "name")?.to_string();
    let base_url = require_field(&upload.base_url, "base_url")?.to_string();
    let kind = parse_kind(require_field(&upload.kind, "kind")?)?;
    let interval_seconds = parse_i64_field("interval_seconds", require_field(&upload.interval_seconds, "interval_seconds")?)?;
    let timeout_seconds = parse_i64_field("timeout_seconds", require_field(&upload.timeout_seconds, "timeout_seconds")?)?;
    let jitter_seconds = upload.jitter_seconds.as_deref().map(|s| parse_i64_field("jitter_seconds", s)).transpose()?.unwrap_or(0);
    let down_after_failures =
        parse_i64_field("down_after_failures", require_field(&upload.down_after_failures, "down_after_failures")?)?;
    let up_after_successes =
        parse_i64_field("up_after_successes", require_field(&upload.up_after_successes, "up_after_successes")?)?;
    let source = upload.source.ok_or_else(|| ApiError::invalid_request("missing required file field 'source'"))?;

    validate_schedule(interval_seconds, timeout_seconds, jitter_seconds, down_after_failures, up_after_successes)?;
    if source.len() > state.max_source_bytes {
        return Err(ApiError::invalid_request(format!(
            "source file exceeds the {}-byte limit",
            state.max_source_bytes
        )));
    }

    let test_id = Uuid::new_v4();
    let source_blob_ref =
        state.artifacts.write_source(tenant_id, test_id, kind.expected_extension(), &source).await?;

    let now = Utc::now();
    let test = Test {
        id: test_id,
        tenant_id,
        name,
        base_url,
        kind,
        enabled: true,
        disabled_reason: None,
        disabled_until_ts: None,
        interval_seconds,
        timeout_seconds,
        jitter_seconds,
        down_after_failures,
        up_after_successes,
        source_blob_ref,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_test(&test).await?;

    Ok((http::StatusCode::CREATED, Json(test)))
}

pub async fn list_tests(State(state): St, headers: http::HeaderMap) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = authenticate(&state, &headers).await?.require_tenant()?;
    let tests = state.store.list_tests(tenant_id).await?;
    Ok(Json(tests))
}

pub async fn get_test(
    State(state): St,
    headers: http::HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = authenticate(&state, &headers).await?.require_tenant()?;
    let test = state.store.get_test(tenant_id, id).await?;
    Ok(Json(test))
}

#[derive(Debug, Deserialize)]
pub struct PatchTestRequest {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub interval_seconds: Option<i64>,
    pub timeout_seconds: Option<i64>,
    pub jitter_seconds: Option<i64>,
    pub down_after_failures: Option<i64>,
    pub up_after_successes: Option<i64>,
}

pub async fn patch_test(
    State(state): St,
    headers: http::HeaderMap,
    Path(id): Path<Uuid>,
    Json(patch): Json<PatchTestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = authenticate(&state, &headers).await?.require_tenant()?;
    let mut test = state.store.get_test(tenant_id, id).await?;

    if let Some(name) = patch.name {
        test.name = name;
    }
    if let Some(base_url) = patch.base_url {
        test.base_url = base_url;
    }
    if let Some(v) = patch.interval_seconds {
        test.interval_seconds = v;
    }
    if let Some(v) = patch.timeout_seconds {
        test.timeout_seconds = v;
    }
    if let Some(v) = patch.jitter_seconds {
        test.jitter_seconds = v;
    }
    if let Some(v) = patch.down_after_failures {
        test.down_after_failures = v;
    }
    if let Some(v) = patch.up_after_successes {
        test.up_after_successes = v;
    }
    validate_schedule(
        test.interval_seconds,
        test.timeout_seconds,
        test.jitter_seconds,
        test.down_after_failures,
        test.up_after_successes,
    )?;

    state.store.update_test_schedule(&test).await?;
    let test = state.store.get_test(tenant_id, id).await?;
    Ok(Json(test))
}

pub async fn replace_source(
    State(state): St,
    headers: http::HeaderMap,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = authenticate(&state, &headers).await?.require_tenant()?;
    let test = state.store.get_test(tenant_id, id).await?;
    let upload = drain_multipart(multipart).await?;
    let source = upload.source.ok_or_else(|| ApiError::invalid_request("missing required file field 'source'"))?;

    if source.len() > state.max_source_bytes {
        return Err(ApiError::invalid_request(format!(
            "source file exceeds the {}-byte limit",
            state.max_source_bytes
        )));
    }

    let blob_ref =
        state.artifacts.write_source(tenant_id, test.id, test.kind.expected_extension(), &source).await?;
    state.store.replace_test_source(tenant_id, id, &blob_ref).await?;
    Ok(http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DisableRequest {
    pub reason: String,
    pub until_ts: Option<DateTime<Utc>>,
}

pub async fn disable_test(
    State(state): St,
    headers: http::HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<DisableRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = authenticate(&state, &headers).await?.require_tenant()?;
    let mut test = state.store.get_test(tenant_id, id).await?;
    test.enabled = false;
    test.disabled_reason = Some(body.reason);
    test.disabled_until_ts = body.until_ts;
    state.store.update_test_schedule(&test).await?;
    Ok(http::StatusCode::NO_CONTENT)
}

pub async fn enable_test(
    State(state): St,
    headers: http::HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = authenticate(&state, &headers).await?.require_tenant()?;
    let mut test = state.store.get_test(tenant_id, id).await?;
    test.enabled = true;
    test.disabled_reason = None;
    test.disabled_until_ts = None;
    state.store.update_test_schedule(&test).await?;
    Ok(http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct TriggerRunResponse {
    pub queued: bool,
}

pub async fn trigger_run(
    State(state): St,
    headers: http::HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = authenticate(&state, &headers).await?.require_tenant()?;
    let test = state.store.get_test(tenant_id, id).await?;
    if !test.enabled {
        return Err(ApiError::invalid_request("cannot run a disabled test"));
    }
    let queued = state.store.enqueue_if_idle(test.id, Utc::now()).await?;
    Ok(Json(TriggerRunResponse { queued }))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub limit: Option<i64>,
}

pub async fn list_runs(
    State(state): St,
    headers: http::HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant_id = authenticate(&state, &headers).await?.require_tenant()?;
    // Scopes the lookup to the caller's tenant before listing its runs.
    let test = state.store.get_test(tenant_id, id).await?;
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let runs = state.store.list_runs_for_test(test.id, limit).await?;
    Ok(Json(runs))
}

async fn resolve_run(state: &AppState, scope: AuthScope, run_id: Uuid) -> Result<Run, ApiError> {
    match scope {
        AuthScope::Admin => Ok(state.store.get_run(run_id).await?),
        AuthScope::Tenant(tenant_id) => Ok(state.store.get_run_for_tenant(tenant_id, run_id).await?),
    }
}

pub async fn get_run(
    State(state): St,
    headers: http::HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let scope = authenticate(&state, &headers).await?;
    let run = resolve_run(&state, scope, id).await?;
    Ok(Json(run))
}

pub async fn get_artifact(
    State(state): St,
    headers: http::HeaderMap,
    Path((id, name)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let scope = authenticate(&state, &headers).await?;
    let run = resolve_run(&state, scope, id).await?;
    let test = state.store.get_test_by_id(run.test_id).await?;

    let bytes = state.artifacts.read(test.tenant_id, test.id, run.id, &name).await?.ok_or_else(ApiError::not_found)?;
    let content_type = content_type_for(&name);
    Ok(([(http::header::CONTENT_TYPE, content_type)], bytes))
}

fn content_type_for(name: &str) -> &'static str {
    if name.ends_with(".png") {
        "image/png"
    } else if name.ends_with(".log") || name.ends_with(".txt") {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

#[derive(Debug, Serialize)]
pub struct StatusSummaryResponse {
    pub tests_total: i64,
    pub tests_failing: i64,
    pub slowest: Vec<crate::store::HeartbeatSlowEntry>,
    pub last_run_per_tenant: Vec<crate::store::LastRunEntry>,
}

pub async fn status_summary(State(state): St, headers: http::HeaderMap) -> Result<impl IntoResponse, ApiError> {
    let scope = authenticate(&state, &headers).await?;
    if !scope.is_admin() {
        return Err(ApiError::not_found());
    }
    let summary = state.store.status_summary(state.status_slowest_n).await?;
    Ok(Json(StatusSummaryResponse {
        tests_total: summary.tests_total,
        tests_failing: summary.tests_failing,
        slowest: summary.slowest,
        last_run_per_tenant: summary.last_run_per_tenant,
    }))
}

pub async fn healthz(State(state): St) -> impl IntoResponse {
    match state.store.status_summary(state.status_slowest_n).await {
        Ok(_) => (http::StatusCode::OK, Json(serde_json::json!({"status": "ok"}))),
        Err(e) => (
            http::StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "unavailable", "error": e.to_string()})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kind_rejects_unknown_kind() {
        assert!(parse_kind("script_ruby").is_err());
    }

    #[test]
    fn parse_kind_accepts_known_kinds() {
        assert_eq!(parse_kind("script_python").unwrap(), TestKind::ScriptPython);
        assert_eq!(parse_kind("script_js").unwrap(), TestKind::ScriptJs);
    }

    #[test]
    fn validate_schedule_rejects_interval_below_minimum() {
        assert!(validate_schedule(1, 30, 0, 1, 1).is_err());
    }

    #[test]
    fn validate_schedule_rejects_timeout_above_maximum() {
        assert!(validate_schedule(300, 10_000, 0, 1, 1).is_err());
    }

    #[test]
    fn validate_schedule_rejects_jitter_above_interval() {
        assert!(validate_schedule(300, 30, 301, 1, 1).is_err());
    }

    #[test]
    fn validate_schedule_rejects_negative_jitter() {
        assert!(validate_schedule(300, 30, -1, 1, 1).is_err());
    }

    #[test]
    fn validate_schedule_rejects_non_positive_down_after_failures() {
        assert!(validate_schedule(300, 30, 0, 0, 1).is_err());
    }

    #[test]
    fn validate_schedule_rejects_non_positive_up_after_successes() {
        assert!(validate_schedule(300, 30, 0, 1, 0).is_err());
    }

    #[test]
    fn validate_schedule_accepts_in_bounds_values() {
        assert!(validate_schedule(300, 30, 30, 1, 1).is_ok());
    }

    #[test]
    fn content_type_for_known_extensions() {
        assert_eq!(content_type_for("failure.png"), "image/png");
        assert_eq!(content_type_for("run.log"), "text/plain; charset=utf-8");
        assert_eq!(content_type_for("trace.zip"), "application/octet-stream");
    }
}
