//! HTTP transport: a small REST surface plus single-shot JSON-RPC at
//! `POST /acp`. Responses carry a request id that also appears in the logs.

use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::http::Method;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use gateway_core::NullSink;
use gateway_protocol::PromptParams;
use gateway_protocol::jsonrpc;
use gateway_protocol::jsonrpc::JsonRpcMessage;
use gateway_protocol::jsonrpc::JsonRpcRequest;
use serde_json::Value;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::dispatch::Gateway;

#[derive(Clone)]
struct AppState {
    gateway: Gateway,
    started: Instant,
}

pub fn http_router(gateway: Gateway) -> Router {
    let state = AppState {
        gateway,
        started: Instant::now(),
    };
    Router::new()
        .route("/health", get(health))
        .route("/process", post(process_echo))
        .route("/process-prompt", post(process_prompt))
        .route("/acp", post(acp))
        .layer(axum::middleware::from_fn(cors_and_request_id))
        .with_state(state)
}

/// Wildcard CORS plus a UUID request id on every response. `OPTIONS`
/// preflights return 200 immediately.
async fn cors_and_request_id(request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    info!(request_id, method = %request.method(), path = %request.uri().path(), "http request");

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET,POST,PUT,DELETE,OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("x-request-id", value);
    }
    response
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let config = &state.gateway.services().config;
    let mut body = json!({
        "status": "ok",
        "agent": gateway_core::AGENT_NAME,
        "version": gateway_core::AGENT_VERSION,
        "uptimeSecs": state.started.elapsed().as_secs(),
        "flags": {
            "persistentWorkspace": config.persistent_workspace_id.is_some(),
            "disableStreamingSdk": config.disable_streaming_sdk,
            "forceHttpApi": config.force_http_api,
            "developmentMode": config.development_mode,
        },
    });
    if !config.skip_cli_check
        && let Some(obj) = body.as_object_mut()
    {
        obj.insert(
            "apiKeyConfigured".to_string(),
            Value::Bool(config.api_key.is_some()),
        );
    }
    Json(body)
}

/// Generic echo used by deployment health probes.
async fn process_echo(body: String) -> Json<Value> {
    let received = serde_json::from_str(&body).unwrap_or(Value::Null);
    Json(json!({"ok": true, "received": received}))
}

/// Synchronous wrapper around the orchestrator: no streaming, just the
/// terminal result. Update notifications are dropped by design here.
async fn process_prompt(
    State(state): State<AppState>,
    body: Json<Value>,
) -> Response {
    let Json(value) = body;
    let params: PromptParams = match serde_json::from_value(value) {
        Ok(params) => params,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("invalid request: {e}")})),
            )
                .into_response();
        }
    };

    match state
        .gateway
        .orchestrator()
        .run_prompt(params, &NullSink)
        .await
    {
        Ok(result) => Json(json!({"ok": true, "result": result})).into_response(),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"ok": false, "error": e.to_string()})),
        )
            .into_response(),
    }
}

/// One JSON-RPC request per call. A body that does not parse yields the
/// literal parse-error response with a null id and HTTP 400.
async fn acp(State(state): State<AppState>, body: String) -> Response {
    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(_) => {
            let error = JsonRpcMessage::error(None, jsonrpc::PARSE_ERROR, "Parse error");
            return (StatusCode::BAD_REQUEST, Json(error)).into_response();
        }
    };

    let response = state.gateway.handle_request(request, &NullSink).await;
    Json(response).into_response()
}
