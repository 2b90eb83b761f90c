use axum::body::Body;
use axum::http::Request;
use axum::http::StatusCode;
use gateway_server::http_router;
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;
use tower::util::ServiceExt;

use crate::common::gateway_with;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_liveness_and_flags() {
    let dir = TempDir::new().unwrap();
    let app = http_router(gateway_with(dir.path(), Vec::new()));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["agent"], "claude-code-container");
    assert_eq!(body["flags"]["persistentWorkspace"], false);
}

#[tokio::test]
async fn acp_parse_error_is_http_400_with_null_id() {
    let dir = TempDir::new().unwrap();
    let app = http_router(gateway_with(dir.path(), Vec::new()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/acp")
                .header("content-type", "application/json")
                .body(Body::from("{invalid}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(
        body,
        json!({
            "jsonrpc": "2.0",
            "error": {"code": -32700, "message": "Parse error"},
            "id": null,
        })
    );
}

#[tokio::test]
async fn acp_routes_a_valid_request() {
    let dir = TempDir::new().unwrap();
    let app = http_router(gateway_with(dir.path(), Vec::new()));

    let request_body =
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "0.3.1"}});
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/acp")
                .header("content-type", "application/json")
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["agentCapabilities"]["filesRead"], true);
}

#[tokio::test]
async fn options_preflight_short_circuits_with_cors_headers() {
    let dir = TempDir::new().unwrap();
    let app = http_router(gateway_with(dir.path(), Vec::new()));

    let response = app
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/acp")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-methods")
            .unwrap(),
        "GET,POST,PUT,DELETE,OPTIONS"
    );
}

#[tokio::test]
async fn process_echoes_its_body() {
    let dir = TempDir::new().unwrap();
    let app = http_router(gateway_with(dir.path(), Vec::new()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/process")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"probe": 7}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body, json!({"ok": true, "received": {"probe": 7}}));
}
