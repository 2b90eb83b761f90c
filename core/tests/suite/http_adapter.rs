//! Wire-level tests for the HTTP adapters against a mock messages endpoint.

use std::sync::Arc;

use gateway_core::AdapterContext;
use gateway_core::AdapterEvent;
use gateway_core::ErrorCode;
use gateway_core::ModelAdapter;
use gateway_core::SandboxLimits;
use gateway_core::ToolSandbox;
use gateway_core::compose;
use gateway_protocol::ContentBlock;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

fn sse_body(frames: &[&str]) -> String {
    frames
        .iter()
        .map(|frame| format!("data: {frame}\n\n"))
        .collect()
}

fn text_stream_frames() -> Vec<&'static str> {
    vec![
        r#"{"type":"message_start","message":{"usage":{"input_tokens":11}}}"#,
        r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hel"}}"#,
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
        r#"{"type":"content_block_stop","index":0}"#,
        r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":3}}"#,
        r#"{"type":"message_stop"}"#,
    ]
}

fn sse_response(frames: &[&str]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_raw(sse_body(frames), "text/event-stream")
}

fn ctx_with_key() -> AdapterContext {
    AdapterContext {
        api_key: Some("test-key".to_string()),
        ..AdapterContext::default()
    }
}

fn user_prompt(text: &str) -> gateway_core::ComposedPrompt {
    compose(&[ContentBlock::text(text)], &[], gateway_core::AgentRole::Other)
}

async fn drain_deltas(rx: &mut mpsc::Receiver<AdapterEvent>) -> Vec<String> {
    let mut deltas = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let AdapterEvent::Delta { text } = event {
            deltas.push(text);
        }
    }
    deltas
}

#[tokio::test]
async fn http_adapter_streams_text_and_sends_the_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(sse_response(&text_stream_frames()))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = gateway_core::HttpApiAdapter::with_base_url(server.uri());
    let (tx, mut rx) = mpsc::channel(64);
    let result = adapter
        .run(
            &user_prompt("say hello"),
            &[],
            &ctx_with_key(),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.full_text, "hello");
    assert_eq!(result.tokens.input, 11);
    assert_eq!(result.tokens.output, 3);
    assert_eq!(drain_deltas(&mut rx).await, vec!["hel".to_string(), "lo".to_string()]);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[0].headers.get("x-api-key").unwrap(), "test-key");
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"][0]["role"], "user");
}

#[tokio::test]
async fn unauthorized_maps_to_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let adapter = gateway_core::HttpApiAdapter::with_base_url(server.uri());
    let (tx, _rx) = mpsc::channel(64);
    let err = adapter
        .run(
            &user_prompt("hi"),
            &[],
            &ctx_with_key(),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AuthError);
}

#[tokio::test]
async fn rate_limit_is_retried_until_the_stream_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(sse_response(&text_stream_frames()))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = gateway_core::HttpApiAdapter::with_base_url(server.uri());
    let (tx, _rx) = mpsc::channel(64);
    let result = adapter
        .run(
            &user_prompt("hi"),
            &[],
            &ctx_with_key(),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.full_text, "hello");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn sdk_adapter_executes_the_requested_tool_and_reports_it_back() {
    let server = MockServer::start().await;

    // First turn: the model asks for a file write.
    let tool_turn = [
        r#"{"type":"message_start","message":{"usage":{"input_tokens":20}}}"#,
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Writing it now."}}"#,
        r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"write_file","input":{}}}"#,
        r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"path\":\"greeting.txt\",\"content\":\"hi there\"}"}}"#,
        r#"{"type":"content_block_stop","index":1}"#,
        r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":15}}"#,
        r#"{"type":"message_stop"}"#,
    ];
    // Second turn: the model wraps up.
    let final_turn = [
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" Done."}}"#,
        r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":4}}"#,
        r#"{"type":"message_stop"}"#,
    ];
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(sse_response(&tool_turn))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(sse_response(&final_turn))
        .expect(1)
        .mount(&server)
        .await;

    let workspace = TempDir::new().unwrap();
    let sandbox =
        Arc::new(ToolSandbox::new(workspace.path(), SandboxLimits::default()).unwrap());
    let ctx = AdapterContext {
        api_key: Some("test-key".to_string()),
        sandbox: Some(Arc::clone(&sandbox)),
        ..AdapterContext::default()
    };

    let adapter = gateway_core::SdkAdapter::with_base_url(server.uri());
    let (tx, mut rx) = mpsc::channel(64);
    let result = adapter
        .run(
            &user_prompt("write a greeting file"),
            &[],
            &ctx,
            &tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.full_text, "Writing it now. Done.");
    let written = tokio::fs::read_to_string(workspace.path().join("greeting.txt"))
        .await
        .unwrap();
    assert_eq!(written, "hi there");

    // The tool call and its result were surfaced as stream events.
    let mut saw_call = false;
    let mut saw_result = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            AdapterEvent::ToolCall { name, .. } => {
                assert_eq!(name, "write_file");
                saw_call = true;
            }
            AdapterEvent::ToolResult { is_error, .. } => {
                assert!(!is_error);
                saw_result = true;
            }
            _ => {}
        }
    }
    assert!(saw_call && saw_result);

    // The second request carried the tool result back to the model.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let second: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    let messages = second["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[2]["content"][0]["type"], "tool_result");
    assert_eq!(messages[2]["content"][0]["tool_use_id"], "tu_1");
}
