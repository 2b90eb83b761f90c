//! Method routing shared by the stdio and HTTP transports.

use std::sync::Arc;

use gateway_core::AGENT_NAME;
use gateway_core::AGENT_VERSION;
use gateway_core::Config;
use gateway_core::ErrorCode;
use gateway_core::OrchestratorError;
use gateway_core::PromptOrchestrator;
use gateway_core::Services;
use gateway_core::UpdateSink;
use gateway_protocol::AgentCapabilities;
use gateway_protocol::AgentInfo;
use gateway_protocol::CancelParams;
use gateway_protocol::InitializeParams;
use gateway_protocol::InitializeResult;
use gateway_protocol::LoadSessionParams;
use gateway_protocol::NewSessionParams;
use gateway_protocol::PROTOCOL_VERSION;
use gateway_protocol::PromptParams;
use gateway_protocol::ReadTextFileParams;
use gateway_protocol::ReadTextFileResult;
use gateway_protocol::SetModeParams;
use gateway_protocol::WriteTextFileParams;
use gateway_protocol::jsonrpc;
use gateway_protocol::jsonrpc::JsonRpcMessage;
use gateway_protocol::jsonrpc::JsonRpcRequest;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tracing::info;

/// Transport-independent application state: the services record plus the
/// orchestrator facade, built once at startup.
#[derive(Clone)]
pub struct Gateway {
    services: Arc<Services>,
    orchestrator: Arc<PromptOrchestrator>,
}

impl Gateway {
    pub fn new(config: Config) -> Self {
        Self::with_services(Arc::new(Services::from_config(config)))
    }

    /// Build the gateway around a pre-assembled services record (tests swap
    /// in scripted adapters this way).
    pub fn with_services(services: Arc<Services>) -> Self {
        let orchestrator = Arc::new(PromptOrchestrator::new(Arc::clone(&services)));
        Self {
            services,
            orchestrator,
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn orchestrator(&self) -> &Arc<PromptOrchestrator> {
        &self.orchestrator
    }

    /// Route one JSON-RPC request to its handler and frame the outcome.
    /// Notifications produced while the request runs go to `sink`; the
    /// returned message is the terminal response.
    pub async fn handle_request(
        &self,
        request: JsonRpcRequest,
        sink: &dyn UpdateSink,
    ) -> JsonRpcMessage {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        info!(%id, method, "request");

        match method.as_str() {
            "initialize" => {
                let params: InitializeParams = match parse_params(params) {
                    Ok(params) => params,
                    Err(message) => return invalid_params(id, message),
                };
                if params.protocol_version.is_empty() {
                    return invalid_params(id, "protocolVersion is required".to_string());
                }
                respond(id, &self.initialize_result())
            }
            "session/new" => {
                let params: NewSessionParams = match parse_params_or_default(params) {
                    Ok(params) => params,
                    Err(message) => return invalid_params(id, message),
                };
                match self.orchestrator.new_session(params).await {
                    Ok(result) => respond(id, &result),
                    Err(e) => error_response(id, e, self.services.config.development_mode),
                }
            }
            "session/load" => {
                let params: LoadSessionParams = match parse_params(params) {
                    Ok(params) => params,
                    Err(message) => return invalid_params(id, message),
                };
                if params.session_id.is_empty() {
                    return invalid_params(id, "sessionId must not be empty".to_string());
                }
                match self.orchestrator.load_session(params).await {
                    Ok(result) => respond(id, &result),
                    Err(e) => error_response(id, e, self.services.config.development_mode),
                }
            }
            "session/prompt" => {
                let params: PromptParams = match parse_params(params) {
                    Ok(params) => params,
                    Err(message) => return invalid_params(id, message),
                };
                if params.session_id.is_empty() {
                    return invalid_params(id, "sessionId must not be empty".to_string());
                }
                if params.content.is_empty() {
                    return invalid_params(id, "content must not be empty".to_string());
                }
                match self.orchestrator.run_prompt(params, sink).await {
                    Ok(result) => respond(id, &result),
                    Err(e) => error_response(id, e, self.services.config.development_mode),
                }
            }
            "session/setMode" => {
                let params: SetModeParams = match parse_params(params) {
                    Ok(params) => params,
                    Err(message) => return invalid_params(id, message),
                };
                match self.orchestrator.set_mode(params).await {
                    Ok(result) => respond(id, &result),
                    Err(e) => error_response(id, e, self.services.config.development_mode),
                }
            }
            "cancel" => {
                let params: CancelParams = match parse_params(params) {
                    Ok(params) => params,
                    Err(message) => return invalid_params(id, message),
                };
                if params.session_id.is_empty() {
                    return invalid_params(id, "sessionId must not be empty".to_string());
                }
                respond(id, &self.orchestrator.cancel(&params))
            }
            "fs/readTextFile" => {
                let params: ReadTextFileParams = match parse_params(params) {
                    Ok(params) => params,
                    Err(message) => return invalid_params(id, message),
                };
                match self.read_text_file(&params).await {
                    Ok(result) => respond(id, &result),
                    Err(e) => error_response(id, e, self.services.config.development_mode),
                }
            }
            "fs/writeTextFile" => {
                let params: WriteTextFileParams = match parse_params(params) {
                    Ok(params) => params,
                    Err(message) => return invalid_params(id, message),
                };
                match self.write_text_file(&params).await {
                    Ok(()) => respond(id, &json!({})),
                    Err(e) => error_response(id, e, self.services.config.development_mode),
                }
            }
            _ => JsonRpcMessage::error(
                Some(id),
                jsonrpc::METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            ),
        }
    }

    fn initialize_result(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            agent_capabilities: AgentCapabilities {
                edit_workspace: true,
                files_read: true,
                files_write: true,
                session_persistence: true,
                streaming_updates: true,
                github_integration: self.services.github.is_enabled(),
            },
            agent_info: AgentInfo {
                name: AGENT_NAME.to_string(),
                version: AGENT_VERSION.to_string(),
            },
        }
    }

    async fn read_text_file(
        &self,
        params: &ReadTextFileParams,
    ) -> Result<ReadTextFileResult, OrchestratorError> {
        let sandbox = self.orchestrator.sandbox_for(&params.session_id).await?;
        let read = sandbox
            .read_file(&params.path)
            .await
            .map_err(gateway_core::ClassifiedError::from)?;
        Ok(ReadTextFileResult {
            content: read.content,
        })
    }

    async fn write_text_file(
        &self,
        params: &WriteTextFileParams,
    ) -> Result<(), OrchestratorError> {
        let sandbox = self.orchestrator.sandbox_for(&params.session_id).await?;
        sandbox
            .write_file(&params.path, &params.content)
            .await
            .map_err(gateway_core::ClassifiedError::from)?;
        Ok(())
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, String> {
    let params = params.ok_or_else(|| "params are required".to_string())?;
    serde_json::from_value(params).map_err(|e| format!("invalid params: {e}"))
}

fn parse_params_or_default<T: serde::de::DeserializeOwned + Default>(
    params: Option<Value>,
) -> Result<T, String> {
    match params {
        None => Ok(T::default()),
        Some(params) => serde_json::from_value(params).map_err(|e| format!("invalid params: {e}")),
    }
}

fn respond<T: Serialize>(id: gateway_protocol::jsonrpc::RequestId, result: &T) -> JsonRpcMessage {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcMessage::response(id, value),
        Err(e) => JsonRpcMessage::error(
            Some(id),
            jsonrpc::INTERNAL_ERROR,
            format!("failed to serialize result: {e}"),
        ),
    }
}

fn invalid_params(id: gateway_protocol::jsonrpc::RequestId, message: String) -> JsonRpcMessage {
    JsonRpcMessage::error(Some(id), jsonrpc::INVALID_PARAMS, message)
}

/// Map handler failures to the wire error table. Secrets never appear here:
/// classified messages are already scrubbed and `original` is log-only.
fn error_response(
    id: gateway_protocol::jsonrpc::RequestId,
    err: OrchestratorError,
    development_mode: bool,
) -> JsonRpcMessage {
    let (code, message, data) = match err {
        OrchestratorError::SessionNotFound(session_id) => (
            jsonrpc::SESSION_NOT_FOUND,
            format!("session not found: {session_id}"),
            None,
        ),
        OrchestratorError::SessionBusy(session_id) => (
            jsonrpc::INVALID_REQUEST,
            format!("session {session_id} already has a prompt in flight"),
            Some(json!({"code": "session_busy", "retryable": true})),
        ),
        OrchestratorError::SessionClosed(session_id) => (
            jsonrpc::INVALID_REQUEST,
            format!("session {session_id} is closed"),
            None,
        ),
        OrchestratorError::InvalidParams(message) => (jsonrpc::INVALID_PARAMS, message, None),
        OrchestratorError::Classified(classified) => {
            let code = match classified.code {
                ErrorCode::AuthError => jsonrpc::AUTHENTICATION_FAILED,
                ErrorCode::WorkspaceMissing | ErrorCode::FsPermission => jsonrpc::WORKSPACE_ERROR,
                ErrorCode::Cancelled => jsonrpc::OPERATION_CANCELLED,
                _ => jsonrpc::INTERNAL_ERROR,
            };
            let mut data = json!({
                "code": classified.code.as_str(),
                "retryable": classified.retryable,
            });
            if let Some(meta) = &classified.meta
                && let Some(obj) = data.as_object_mut()
            {
                obj.insert("meta".to_string(), Value::Object(meta.clone()));
            }
            if development_mode
                && let Some(original) = &classified.original
                && let Some(obj) = data.as_object_mut()
            {
                obj.insert("detail".to_string(), Value::String(original.clone()));
            }
            (code, classified.message, Some(data))
        }
    };

    match data {
        Some(data) => JsonRpcMessage::error_with_data(Some(id), code, message, data),
        None => JsonRpcMessage::error(Some(id), code, message),
    }
}
