//! Control surface integration tests.

use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use axum_test::TestServer;
use sandkeep::api::create_router;
use sandkeep::gateway::WaitOptions;
use serde_json::Value;
use tower::ServiceExt;

mod common;
use common::{Harness, HarnessOptions, StartBehavior, write};

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = Harness::new();
    let app = create_router(h.supervisor.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_unknown_route_returns_structured_error() {
    let h = Harness::new();
    let app = create_router(h.supervisor.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error_code"], "not_found");
}

#[tokio::test]
async fn test_status_before_boot() {
    let h = Harness::new();
    let server = TestServer::new(create_router(h.supervisor.clone())).unwrap();

    let response = server.get("/status").await;

    response.assert_status_ok();
    let json: Value = response.json();
    assert_eq!(json["mount"]["status"], "unmounted");
    assert!(json["restore"].is_null());
    assert_eq!(json["sync"]["armed"], false);
    assert_eq!(json["gateway"]["state"], "not_started");
    assert_eq!(json["failures"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_status_after_boot() {
    let h = Harness::new();
    h.supervisor.boot().await.unwrap();
    let server = TestServer::new(create_router(h.supervisor.clone())).unwrap();

    let json: Value = server.get("/status").await.json();

    assert_eq!(json["mount"]["status"], "mounted");
    assert_eq!(json["restore"]["action"], "skip");
    assert_eq!(json["restore"]["freshness"], "no_remote_state");
    assert_eq!(json["gateway"]["state"], "ready");
    assert_eq!(json["gateway"]["process"]["port"], 18789);
    assert_eq!(json["sync"]["armed"], true);
}

#[tokio::test]
async fn test_manual_sync_skipped_before_restore() {
    let h = Harness::new();
    let server = TestServer::new(create_router(h.supervisor.clone())).unwrap();

    let response = server.post("/sync").await;

    response.assert_status(StatusCode::ACCEPTED);
    let json: Value = response.json();
    assert_eq!(json["trigger"], "manual");
    assert_eq!(json["outcome"]["status"], "skipped");
    assert_eq!(json["outcome"]["reason"], "restore-pending");
}

#[tokio::test]
async fn test_manual_sync_after_boot() {
    let h = Harness::new();
    h.supervisor.boot().await.unwrap();
    write(&h.local.join("clawdbot.json"), "{}");
    let server = TestServer::new(create_router(h.supervisor.clone())).unwrap();

    let response = server.post("/sync").await;

    response.assert_status_ok();
    let json: Value = response.json();
    assert_eq!(json["outcome"]["status"], "success");
    assert_eq!(json["outcome"]["epoch"], 1);
}

#[tokio::test]
async fn test_ensure_returns_ready_process() {
    let h = Harness::new();
    let server = TestServer::new(create_router(h.supervisor.clone())).unwrap();

    let first: Value = server.post("/gateway/ensure").await.json();
    let second: Value = server.post("/gateway/ensure").await.json();

    assert_eq!(first["state"], "ready");
    assert_eq!(first["pid"], second["pid"]);
    assert_eq!(first["bind"], "lan");
}

#[tokio::test]
async fn test_ensure_port_in_use_is_bad_gateway() {
    let h = Harness::new();
    *h.registry.port_holder.lock().unwrap() = Some("node (pid 12)".to_string());
    let server = TestServer::new(create_router(h.supervisor.clone())).unwrap();

    let response = server.post("/gateway/ensure").await;

    response.assert_status(StatusCode::BAD_GATEWAY);
    let json: Value = response.json();
    assert_eq!(json["error_code"], "process_start_failed");
    assert_eq!(json["error"], "port 18789 in use by node (pid 12)");
}

#[tokio::test]
async fn test_ensure_readiness_timeout_is_gateway_timeout() {
    let h = Harness::with_options(HarnessOptions {
        behavior: StartBehavior::Silent,
        startup: WaitOptions::new(Duration::from_millis(200), Duration::from_millis(20)),
        ..HarnessOptions::default()
    });
    let server = TestServer::new(create_router(h.supervisor.clone())).unwrap();

    let response = server.post("/gateway/ensure").await;

    response.assert_status(StatusCode::GATEWAY_TIMEOUT);
    let json: Value = response.json();
    assert_eq!(json["error_code"], "readiness_timeout");
}

#[tokio::test]
async fn test_required_storage_is_service_unavailable() {
    let h = Harness::with_options(HarnessOptions {
        mount_fails: true,
        storage_required: true,
        ..HarnessOptions::default()
    });
    let server = TestServer::new(create_router(h.supervisor.clone())).unwrap();

    let response = server.post("/gateway/ensure").await;

    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let json: Value = response.json();
    assert_eq!(json["error_code"], "storage_unavailable");
    assert_eq!(json["error"], "credentials missing (R2_ACCESS_KEY_ID)");
}
