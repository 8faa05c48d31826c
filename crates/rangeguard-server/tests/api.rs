//! HTTP surface tests against the in-memory runtime

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use rangeguard_core::RangeGuardConfig;
use rangeguard_sandbox::FakeRuntime;
use rangeguard_server::Gateway;

fn test_app() -> (Router, Arc<FakeRuntime>) {
    let runtime = FakeRuntime::new();
    let gateway = Gateway::new(RangeGuardConfig::default(), runtime.clone())
        .expect("gateway assembly failed");
    (gateway.router(), runtime)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create_session(app: &Router, session: &str, user: &str) -> String {
    let (status, body) = send(
        app,
        "POST",
        &format!("/session/{}/create", session),
        Some(json!({ "user_id": user })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["container_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_and_status() {
    let (app, _) = test_app();

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(&app, "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runtime_reachable"], true);
    assert_eq!(body["containers"], 0);
}

#[tokio::test]
async fn test_session_create_and_duplicate_conflict() {
    let (app, _) = test_app();
    let container = create_session(&app, "s-1", "alice").await;
    assert!(!container.is_empty());

    let (status, body) = send(
        &app,
        "POST",
        "/session/s-1/create",
        Some(json!({ "user_id": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "SESSION_ACTIVE");
}

#[tokio::test]
async fn test_execute_allowed_command() {
    let (app, runtime) = test_app();
    let container = create_session(&app, "s-1", "alice").await;
    runtime.script("nmap -sV 172.25.0.5", 0, "PORT STATE SERVICE", "").await;

    let (status, body) = send(
        &app,
        "POST",
        "/execute",
        Some(json!({
            "user_id": "alice",
            "container_id": container,
            "command": "nmap -sV 172.25.0.5",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "ALLOWED_EXECUTED");
    assert_eq!(body["exit_code"], 0);
    assert!(body["stdout"].as_str().unwrap().contains("PORT STATE"));
}

#[tokio::test]
async fn test_execute_denied_is_403() {
    let (app, runtime) = test_app();
    let container = create_session(&app, "s-1", "alice").await;

    let (status, body) = send(
        &app,
        "POST",
        "/execute",
        Some(json!({
            "user_id": "alice",
            "container_id": container,
            "command": "rm -rf /",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["outcome"], "BLOCKED");
    assert_eq!(body["verdict"]["code"], "DANGEROUS_PATTERN");
    assert_eq!(runtime.exec_count().await, 0);
}

#[tokio::test]
async fn test_execute_unknown_container_is_404() {
    let (app, _) = test_app();
    let (status, body) = send(
        &app,
        "POST",
        "/execute",
        Some(json!({
            "user_id": "alice",
            "container_id": "sbx-missing",
            "command": "ls",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "CONTAINER_NOT_FOUND");
}

#[tokio::test]
async fn test_breakout_quarantines_and_reports() {
    let (app, _) = test_app();
    let container = create_session(&app, "s-1", "mallory").await;

    let (status, body) = send(
        &app,
        "POST",
        "/execute",
        Some(json!({
            "user_id": "mallory",
            "container_id": container,
            "command": "docker ps",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["verdict"]["code"], "BREAKOUT_DETECTED");

    let (status, report) = send(&app, "GET", "/security/report", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["containers"]["quarantined"], 1);
    assert_eq!(report["active_blocks"][0]["user_id"], "mallory");

    // clearing the block restores the user
    let (status, body) = send(&app, "POST", "/security/unblock/mallory", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], true);

    let (_, report) = send(&app, "GET", "/security/report", None).await;
    assert!(report["active_blocks"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_snapshot_restore_flow() {
    let (app, _) = test_app();
    let container = create_session(&app, "s-1", "alice").await;

    let (status, body) = send(
        &app,
        "POST",
        &format!("/snapshot/{}?name=after-recon", container),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let snapshot_id = body["snapshot_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, "DELETE", "/session/s-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["terminated"], container);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/restore/{}?session=s-2&user_id=alice", snapshot_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(body["container_id"], container);
}

#[tokio::test]
async fn test_restore_unknown_snapshot_is_404() {
    let (app, _) = test_app();
    let (status, body) = send(&app, "POST", "/restore/snap-missing?session=s-9", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "SNAPSHOT_NOT_FOUND");
}

#[tokio::test]
async fn test_delete_unknown_session_is_404() {
    let (app, _) = test_app();
    let (status, body) = send(&app, "DELETE", "/session/s-missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "CONTAINER_NOT_FOUND");
}

#[tokio::test]
async fn test_audit_log_query_and_pagination() {
    let (app, _) = test_app();
    let container = create_session(&app, "s-1", "alice").await;

    for command in ["ls", "cat /etc/hosts", "rm -rf /"] {
        send(
            &app,
            "POST",
            "/execute",
            Some(json!({
                "user_id": "alice",
                "container_id": container,
                "command": command,
            })),
        )
        .await;
    }

    let (status, body) = send(&app, "GET", "/security/audit-log?user_id=alice", None).await;
    assert_eq!(status, StatusCode::OK);
    let events = body["events"].as_array().unwrap();
    // provisioning plus three commands
    assert_eq!(events.len(), 4);

    // page past the first two events
    let second_seq = events[1]["seq"].as_u64().unwrap();
    let uri = format!("/security/audit-log?user_id=alice&after_seq={}", second_seq);
    let (_, body) = send(&app, "GET", &uri, None).await;
    let page = body["events"].as_array().unwrap();
    assert_eq!(page.len(), 2);
    assert!(page[0]["seq"].as_u64().unwrap() > second_seq);
}
