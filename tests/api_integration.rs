//! End-to-end exercise of the Registry API router against a real (tempdir)
//! SQLite store and artifact directory, the same `tower::ServiceExt::oneshot`
//! pattern used across the example pack's axum services.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use vigil::alert::NullAlertSink;
use vigil::api::{self, AppState};
use vigil::artifact::ArtifactStore;
use vigil::config::{AuthConfig, HeartbeatConfig, StoreConfig};
use vigil::store::Store;

async fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::connect(&dir.path().join("store.db")).await.unwrap();
    let artifacts = ArtifactStore::new(dir.path().join("artifacts"));
    let auth = AuthConfig {
        admin_token: "admin-secret".to_string(),
        monitor_token: "monitor-secret".to_string(),
    };
    let store_config = StoreConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let state = Arc::new(AppState::new(
        store,
        artifacts,
        Arc::new(NullAlertSink),
        None,
        auth,
        &store_config,
        &HeartbeatConfig::default(),
    ));
    (state, dir)
}

#[tokio::test]
async fn healthz_requires_no_authentication() {
    let (state, _dir) = test_state().await;
    let router = api::build_router(state);

    let response = router
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn list_tests_without_bearer_token_is_unauthorized() {
    let (state, _dir) = test_state().await;
    let router = api::build_router(state);

    let response = router
        .oneshot(Request::builder().uri("/api/v1/tests").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn status_summary_rejects_a_tenant_scoped_token() {
    let (state, _dir) = test_state().await;
    let tenant = state.store.create_tenant("acme").await.unwrap();
    let (_key, raw_token) = state.store.create_api_key(tenant.id).await.unwrap();
    let router = api::build_router(state);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/v1/status/summary")
                .header("authorization", format!("Bearer {raw_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_summary_accepts_the_admin_token() {
    let (state, _dir) = test_state().await;
    let router = api::build_router(state);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/v1/status/summary")
                .header("authorization", "Bearer admin-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn status_summary_includes_slowest_and_last_run_per_tenant() {
    let (state, _dir) = test_state().await;
    state.store.create_tenant("acme").await.unwrap();
    let router = api::build_router(state);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/v1/status/summary")
                .header("authorization", "Bearer admin-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(body.get("slowest").is_some());
    let last_run_per_tenant = body.get("last_run_per_tenant").unwrap().as_array().unwrap();
    assert_eq!(last_run_per_tenant.len(), 1);
    assert_eq!(last_run_per_tenant[0]["tenant_name"], "acme");
    assert!(last_run_per_tenant[0]["run_id"].is_null());
}

#[tokio::test]
async fn upload_list_and_fetch_a_test_round_trip() {
    let (state, _dir) = test_state().await;
    let tenant = state.store.create_tenant("acme").await.unwrap();
    let (_key, raw_token) = state.store.create_api_key(tenant.id).await.unwrap();
    let router = api::build_router(state);

    let boundary = "vigil-test-boundary";
    let body = format!(
        "--{b}\r\n\
         Content-Disposition: form-data; name=\"name\"\r\n\r\n\
         homepage-smoke\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"base_url\"\r\n\r\n\
         https://example.com\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"kind\"\r\n\r\n\
         script_python\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"interval_seconds\"\r\n\r\n\
         300\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"timeout_seconds\"\r\n\r\n\
         30\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"down_after_failures\"\r\n\r\n\
         2\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"up_after_successes\"\r\n\r\n\
         2\r\n\
         --{b}\r\n\
         Content-Disposition: form-data; name=\"source\"; filename=\"test.py\"\r\n\
         Content-Type: text/x-python\r\n\r\n\
         print('ok')\r\n\
         --{b}--\r\n",
        b = boundary
    );

    let upload_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/tests/upload")
                .header("authorization", format!("Bearer {raw_token}"))
                .header("content-type", format!("multipart/form-data; boundary={boundary}"))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(upload_response.status(), StatusCode::CREATED);
    let bytes = axum::body::to_bytes(upload_response.into_body(), usize::MAX).await.unwrap();
    let created: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(created["name"], "homepage-smoke");
    assert_eq!(created["enabled"], true);

    let list_response = router
        .oneshot(
            Request::builder()
                .uri("/api/v1/tests")
                .header("authorization", format!("Bearer {raw_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(list_response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(list_response.into_body(), usize::MAX).await.unwrap();
    let tests: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(tests.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn another_tenants_test_is_not_found_not_forbidden() {
    let (state, _dir) = test_state().await;
    let owner = state.store.create_tenant("owner").await.unwrap();
    let intruder = state.store.create_tenant("intruder").await.unwrap();
    let (_owner_key, owner_token) = state.store.create_api_key(owner.id).await.unwrap();
    let (_intruder_key, intruder_token) = state.store.create_api_key(intruder.id).await.unwrap();

    let test_id = uuid::Uuid::new_v4();
    let now = chrono::Utc::now();
    state
        .store
        .insert_test(&vigil::model::Test {
            id: test_id,
            tenant_id: owner.id,
            name: "owner-only".to_string(),
            base_url: "https://example.com".to_string(),
            kind: vigil::model::TestKind::ScriptPython,
            enabled: true,
            disabled_reason: None,
            disabled_until_ts: None,
            interval_seconds: 300,
            timeout_seconds: 30,
            jitter_seconds: 0,
            down_after_failures: 2,
            up_after_successes: 2,
            source_blob_ref: "sources/x/y/source.py".to_string(),
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    let router = api::build_router(state);
    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/tests/{test_id}"))
                .header("authorization", format!("Bearer {intruder_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let _ = owner_token;
}
