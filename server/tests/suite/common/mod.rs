use std::path::Path;
use std::sync::Arc;

use gateway_core::Config;
use gateway_core::FakeAdapter;
use gateway_core::InFlightRegistry;
use gateway_core::ModelAdapter;
use gateway_core::NoopGithubAutomation;
use gateway_core::RuntimeSelector;
use gateway_core::Services;
use gateway_core::SessionStore;
use gateway_core::WorkspaceManager;
use gateway_protocol::jsonrpc::JsonRpcMessage;
use gateway_protocol::jsonrpc::JsonRpcRequest;
use gateway_protocol::jsonrpc::RequestId;
use gateway_server::Gateway;
use serde_json::Value;

pub fn test_config(state_dir: &Path) -> Config {
    Config {
        state_dir: state_dir.to_path_buf(),
        persistent_workspace_id: None,
        workspace_root: None,
        disable_streaming_sdk: false,
        force_http_api: false,
        skip_cli_check: true,
        max_patch_bytes: 200 * 1024,
        development_mode: false,
        running_as_root: false,
        api_key: None,
        github_token: None,
        http_port: None,
    }
}

/// A gateway whose selector holds exactly the given scripted adapters.
pub fn gateway_with(state_dir: &Path, adapters: Vec<Arc<FakeAdapter>>) -> Gateway {
    let config = test_config(state_dir);
    let store = Arc::new(SessionStore::new(config.sessions_dir()));
    let workspaces = Arc::new(WorkspaceManager::new(&config));
    let adapters: Vec<Arc<dyn ModelAdapter>> = adapters
        .into_iter()
        .map(|adapter| adapter as Arc<dyn ModelAdapter>)
        .collect();
    let services = Arc::new(Services {
        config: Arc::new(config),
        store,
        workspaces,
        selector: Arc::new(RuntimeSelector::with_adapters(adapters)),
        inflight: Arc::new(InFlightRegistry::new()),
        github: Arc::new(NoopGithubAutomation),
    });
    Gateway::with_services(services)
}

pub fn request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: RequestId::Integer(id),
        method: method.to_string(),
        params: Some(params),
    }
}

pub fn result_of(message: JsonRpcMessage) -> Value {
    match message {
        JsonRpcMessage::Response(response) => response.result,
        other => panic!("expected response, got {other:?}"),
    }
}

pub fn error_of(message: JsonRpcMessage) -> (i64, String) {
    match message {
        JsonRpcMessage::Error(error) => (error.error.code, error.error.message),
        other => panic!("expected error, got {other:?}"),
    }
}
