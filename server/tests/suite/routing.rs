use std::sync::Arc;
use std::time::Duration;

use gateway_core::AdapterKind;
use gateway_core::FakeAdapter;
use gateway_core::FakeBehavior;
use gateway_core::NullSink;
use gateway_core::UpdateSink;
use gateway_protocol::SessionUpdateParams;
use gateway_protocol::jsonrpc::JsonRpcMessage;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::common::error_of;
use crate::common::gateway_with;
use crate::common::request;
use crate::common::result_of;

struct CollectingSink(mpsc::Sender<SessionUpdateParams>);

#[async_trait::async_trait]
impl UpdateSink for CollectingSink {
    async fn send_update(&self, update: SessionUpdateParams) {
        let _ = self.0.send(update).await;
    }
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(dir.path(), Vec::new());
    let response = gateway
        .handle_request(request(5, "session/frobnicate", json!({})), &NullSink)
        .await;
    let (code, message) = error_of(response);
    assert_eq!(code, -32601);
    assert!(message.contains("session/frobnicate"));
}

#[tokio::test]
async fn empty_session_id_is_invalid_params() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(dir.path(), Vec::new());
    for method in ["session/load", "cancel"] {
        let response = gateway
            .handle_request(request(6, method, json!({"sessionId": ""})), &NullSink)
            .await;
        let (code, _message) = error_of(response);
        assert_eq!(code, -32602, "{method} should reject empty sessionId");
    }
}

#[tokio::test]
async fn empty_prompt_content_is_invalid_params() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(dir.path(), Vec::new());
    let response = gateway
        .handle_request(
            request(7, "session/prompt", json!({"sessionId": "s", "content": []})),
            &NullSink,
        )
        .await;
    let (code, _message) = error_of(response);
    assert_eq!(code, -32602);
}

#[tokio::test]
async fn prompt_on_unknown_session_is_session_not_found() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(dir.path(), Vec::new());
    let response = gateway
        .handle_request(
            request(
                8,
                "session/prompt",
                json!({"sessionId": "missing", "content": [{"type": "text", "text": "hi"}]}),
            ),
            &NullSink,
        )
        .await;
    let (code, _message) = error_of(response);
    assert_eq!(code, -32000);
}

#[tokio::test]
async fn prompt_streams_updates_then_responds() {
    let dir = TempDir::new().unwrap();
    let adapter = Arc::new(FakeAdapter::new(
        AdapterKind::HttpApi,
        FakeBehavior::Stream {
            deltas: vec!["hel".to_string(), "lo".to_string()],
        },
    ));
    let gateway = gateway_with(dir.path(), vec![adapter]);

    let created = result_of(
        gateway
            .handle_request(request(1, "session/new", json!({})), &NullSink)
            .await,
    );
    let session_id = created["sessionId"].as_str().unwrap().to_string();

    let (tx, mut rx) = mpsc::channel(64);
    let response = gateway
        .handle_request(
            request(
                2,
                "session/prompt",
                json!({
                    "sessionId": session_id,
                    "content": [{"type": "text", "text": "say hello"}],
                }),
            ),
            &CollectingSink(tx),
        )
        .await;
    let result = result_of(response);
    assert_eq!(result["stopReason"], "completed");
    assert!(result["usage"]["outputTokens"].as_u64().unwrap() >= 1);

    let mut statuses = Vec::new();
    while let Ok(update) = rx.try_recv() {
        statuses.push(serde_json::to_value(&update.status).unwrap());
    }
    // At least one progress update, exactly one terminal `completed`, and the
    // terminal update is last (the response itself was produced afterwards).
    assert!(statuses.contains(&json!("working")));
    assert_eq!(
        statuses.iter().filter(|s| **s == json!("completed")).count(),
        1
    );
    assert_eq!(statuses.last().unwrap(), &json!("completed"));
}

#[tokio::test]
async fn cancel_during_prompt_yields_cancelled_stop_reason() {
    let dir = TempDir::new().unwrap();
    let adapter = Arc::new(FakeAdapter::new(
        AdapterKind::HttpApi,
        FakeBehavior::HangUntilCancelled,
    ));
    let gateway = gateway_with(dir.path(), vec![adapter]);

    let created = result_of(
        gateway
            .handle_request(request(1, "session/new", json!({})), &NullSink)
            .await,
    );
    let session_id = created["sessionId"].as_str().unwrap().to_string();

    let prompt = {
        let gateway = gateway.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            gateway
                .handle_request(
                    request(
                        2,
                        "session/prompt",
                        json!({
                            "sessionId": session_id,
                            "content": [{"type": "text", "text": "work"}],
                        }),
                    ),
                    &NullSink,
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancel_response = gateway
        .handle_request(
            request(3, "cancel", json!({"sessionId": session_id})),
            &NullSink,
        )
        .await;
    assert_eq!(result_of(cancel_response)["cancelled"], true);

    let prompt_response = prompt.await.unwrap();
    let result = result_of(prompt_response);
    assert_eq!(result["stopReason"], "cancelled");
}

#[tokio::test]
async fn fs_bridge_reads_and_writes_inside_the_workspace() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(dir.path(), Vec::new());

    let created = result_of(
        gateway
            .handle_request(request(1, "session/new", json!({})), &NullSink)
            .await,
    );
    let session_id = created["sessionId"].as_str().unwrap().to_string();

    let write = gateway
        .handle_request(
            request(
                2,
                "fs/writeTextFile",
                json!({"sessionId": session_id, "path": "notes.txt", "content": "hello"}),
            ),
            &NullSink,
        )
        .await;
    assert!(matches!(write, JsonRpcMessage::Response(_)));

    let read = result_of(
        gateway
            .handle_request(
                request(
                    3,
                    "fs/readTextFile",
                    json!({"sessionId": session_id, "path": "notes.txt"}),
                ),
                &NullSink,
            )
            .await,
    );
    assert_eq!(read["content"], "hello");

    let escape = gateway
        .handle_request(
            request(
                4,
                "fs/readTextFile",
                json!({"sessionId": session_id, "path": "../outside.txt"}),
            ),
            &NullSink,
        )
        .await;
    let (code, _message) = error_of(escape);
    assert_eq!(code, -32001);
}

#[tokio::test]
async fn busy_session_rejects_the_second_prompt() {
    let dir = TempDir::new().unwrap();
    let adapter = Arc::new(FakeAdapter::new(
        AdapterKind::HttpApi,
        FakeBehavior::HangUntilCancelled,
    ));
    let gateway = gateway_with(dir.path(), vec![adapter]);

    let created = result_of(
        gateway
            .handle_request(request(1, "session/new", json!({})), &NullSink)
            .await,
    );
    let session_id = created["sessionId"].as_str().unwrap().to_string();

    let prompt_body = json!({
        "sessionId": session_id,
        "content": [{"type": "text", "text": "work"}],
    });
    let first = {
        let gateway = gateway.clone();
        let prompt_body = prompt_body.clone();
        tokio::spawn(async move {
            gateway
                .handle_request(request(2, "session/prompt", prompt_body), &NullSink)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = gateway
        .handle_request(request(3, "session/prompt", prompt_body), &NullSink)
        .await;
    let (code, message) = error_of(second);
    assert_eq!(code, -32600);
    assert!(message.contains("in flight"));

    gateway
        .handle_request(
            request(4, "cancel", json!({"sessionId": session_id})),
            &NullSink,
        )
        .await;
    let first_result: Value = result_of(first.await.unwrap());
    assert_eq!(first_result["stopReason"], "cancelled");
}
