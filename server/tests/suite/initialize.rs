use gateway_core::NullSink;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use crate::common::error_of;
use crate::common::gateway_with;
use crate::common::request;
use crate::common::result_of;

#[tokio::test]
async fn initialize_reports_capabilities_and_agent_info() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(dir.path(), Vec::new());

    let response = gateway
        .handle_request(
            request(1, "initialize", json!({"protocolVersion": "0.3.1"})),
            &NullSink,
        )
        .await;
    let result = result_of(response);

    assert_eq!(result["agentCapabilities"]["filesRead"], true);
    assert_eq!(result["agentCapabilities"]["filesWrite"], true);
    assert_eq!(result["agentCapabilities"]["editWorkspace"], true);
    assert_eq!(result["agentCapabilities"]["streamingUpdates"], true);
    assert_eq!(result["agentInfo"]["name"], "claude-code-container");
    assert!(result["agentInfo"]["version"].is_string());

    let version = result["protocolVersion"].as_str().unwrap();
    assert!(
        version.starts_with("0.3."),
        "unexpected protocol version {version}"
    );
}

#[tokio::test]
async fn initialize_requires_a_protocol_version() {
    let dir = TempDir::new().unwrap();
    let gateway = gateway_with(dir.path(), Vec::new());

    let response = gateway
        .handle_request(request(2, "initialize", json!({})), &NullSink)
        .await;
    let (code, _message) = error_of(response);
    assert_eq!(code, -32602);
}
