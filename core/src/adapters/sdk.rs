//! Streaming adapter with structured tool use.
//!
//! Speaks the messages endpoint's tool-calling protocol: each step streams a
//! model turn, and when the turn stops for tool use the calls are executed
//! through the session's sandbox and their results fed back as the next
//! user message. The step budget bounds how long the model may iterate.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapters::AdapterKind;
use crate::adapters::ModelAdapter;
use crate::adapters::http_api::UsageDelta;
use crate::adapters::http_api::merge_usage;
use crate::classifier::ClassifiedError;
use crate::classifier::ErrorCode;
use crate::error::GatewayErr;
use crate::flags::ANTHROPIC_API_BASE;
use crate::flags::ANTHROPIC_VERSION;
use crate::flags::GATEWAY_REQUEST_MAX_RETRIES;
use crate::flags::GATEWAY_STREAM_IDLE_TIMEOUT_MS;
use crate::models::AdapterContext;
use crate::models::AdapterEvent;
use crate::models::AdapterMessage;
use crate::models::AdapterResult;
use crate::models::TokenUsage;
use crate::models::resolve_model;
use crate::prompt::ComposedPrompt;
use crate::sandbox::ToolSandbox;
use crate::util::backoff;
use gateway_protocol::Role;

/// Maximum tool-call round trips for one prompt.
const MAX_STEPS: usize = 10;
const MAX_TOKENS: u64 = 8192;

#[derive(Debug, Serialize)]
struct ToolDef {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

static TOOL_DEFS: LazyLock<Vec<ToolDef>> = LazyLock::new(|| {
    vec![
        ToolDef {
            name: "read_file",
            description: "Read a file inside the workspace and return its content.",
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            }),
        },
        ToolDef {
            name: "write_file",
            description: "Create or overwrite a file inside the workspace with the given content.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                },
                "required": ["path", "content"],
            }),
        },
        ToolDef {
            name: "list_directory",
            description: "List a directory inside the workspace.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "recursive": {"type": "boolean"},
                },
                "required": ["path"],
            }),
        },
        ToolDef {
            name: "execute_shell",
            description: "Run an allow-listed shell command inside the workspace and return its output.",
            input_schema: json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"],
            }),
        },
        ToolDef {
            name: "delete_path",
            description: "Delete a file or directory inside the workspace.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "recursive": {"type": "boolean"},
                },
                "required": ["path"],
            }),
        },
        ToolDef {
            name: "move_path",
            description: "Move or rename a file inside the workspace.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "from": {"type": "string"},
                    "to": {"type": "string"},
                },
                "required": ["from", "to"],
            }),
        },
        ToolDef {
            name: "apply_patch",
            description: "Apply a unified-diff patch to the workspace.",
            input_schema: json!({
                "type": "object",
                "properties": {"patch": {"type": "string"}},
                "required": ["patch"],
            }),
        },
    ]
});

pub struct SdkAdapter {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl SdkAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: None,
        }
    }

    /// Point the adapter at a different endpoint (tests use a mock server).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: Some(base_url.into()),
        }
    }

    fn api_base(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| ANTHROPIC_API_BASE.to_string())
    }
}

impl Default for SdkAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ModelAdapter for SdkAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Sdk
    }

    fn can_handle(&self, ctx: &AdapterContext) -> bool {
        !ctx.disable_streaming_sdk && ctx.api_key.is_some() && ctx.sandbox.is_some()
    }

    async fn run(
        &self,
        prompt: &ComposedPrompt,
        input: &[AdapterMessage],
        ctx: &AdapterContext,
        events: &mpsc::Sender<AdapterEvent>,
        cancel: &CancellationToken,
    ) -> Result<AdapterResult, ClassifiedError> {
        let sandbox = ctx.sandbox.clone().ok_or_else(|| {
            ClassifiedError::new(ErrorCode::Unknown, "sdk adapter requires a sandbox")
        })?;
        let api_key = ctx.api_key.clone().unwrap_or_default();
        let model = resolve_model(ctx.model.as_deref());

        let mut messages = wire_messages(prompt, input);
        let mut full_text = String::new();
        let mut tokens = TokenUsage::default();
        let started = Instant::now();
        let _ = events.send(AdapterEvent::Started).await;

        for step in 0..MAX_STEPS {
            let payload = build_payload(&model, prompt, &messages);
            let response = self.open_stream(&payload, &api_key, cancel).await?;
            let stream = response.bytes_stream().map_err(GatewayErr::Reqwest);
            let turn = consume_turn(stream, events, cancel, &mut tokens).await?;

            if !turn.text.is_empty() {
                full_text.push_str(&turn.text);
            }

            let wants_tools =
                turn.stop_reason.as_deref() == Some("tool_use") && !turn.tool_uses.is_empty();
            if !wants_tools || step + 1 == MAX_STEPS {
                break;
            }

            messages.push(assistant_turn_message(&turn));
            let mut results = Vec::with_capacity(turn.tool_uses.len());
            for tool_use in &turn.tool_uses {
                let _ = events
                    .send(AdapterEvent::ToolCall {
                        id: tool_use.id.clone(),
                        name: tool_use.name.clone(),
                        input: tool_use.input.clone(),
                    })
                    .await;

                let (output, is_error) = execute_tool(&sandbox, tool_use, cancel).await?;
                let _ = events
                    .send(AdapterEvent::ToolResult {
                        id: tool_use.id.clone(),
                        name: tool_use.name.clone(),
                        output: output.clone(),
                        is_error,
                    })
                    .await;

                results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use.id,
                    "content": output,
                    "is_error": is_error,
                }));
            }
            messages.push(json!({"role": "user", "content": results}));
        }

        let _ = events
            .send(AdapterEvent::Completed {
                full_text: full_text.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
            })
            .await;

        Ok(AdapterResult {
            full_text,
            tokens,
            cost: None,
        })
    }
}

impl SdkAdapter {
    /// POST the payload, retrying transient failures, and hand back the
    /// successful streaming response.
    async fn open_stream(
        &self,
        payload: &Value,
        api_key: &str,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ClassifiedError> {
        let url = format!("{}/v1/messages", self.api_base());
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(ClassifiedError::cancelled());
            }

            let request = self
                .client
                .post(&url)
                .header("x-api-key", api_key)
                .header("anthropic-version", *ANTHROPIC_VERSION)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(payload)
                .send();
            let res = tokio::select! {
                res = request => res,
                _ = cancel.cancelled() => return Err(ClassifiedError::cancelled()),
            };

            match res {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp);
                }
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        return Err(ClassifiedError::new(
                            ErrorCode::AuthError,
                            "model backend rejected the api key",
                        ));
                    }
                    if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(GatewayErr::UnexpectedStatus(status, body).into());
                    }
                    if attempt > *GATEWAY_REQUEST_MAX_RETRIES {
                        return Err(GatewayErr::RetryLimit(status).into());
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => {
                    if attempt > *GATEWAY_REQUEST_MAX_RETRIES {
                        return Err(GatewayErr::Reqwest(e).into());
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }
}

fn wire_messages(prompt: &ComposedPrompt, input: &[AdapterMessage]) -> Vec<Value> {
    let mut messages: Vec<Value> = input
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            json!({"role": role, "content": [{"type": "text", "text": message.text()}]})
        })
        .collect();
    if messages.is_empty() {
        messages.push(json!({
            "role": "user",
            "content": [{"type": "text", "text": prompt.body}],
        }));
    }
    messages
}

fn build_payload(model: &str, prompt: &ComposedPrompt, messages: &[Value]) -> Value {
    let mut payload = json!({
        "model": model,
        "max_tokens": MAX_TOKENS,
        "messages": messages,
        "tools": &*TOOL_DEFS,
        "stream": true,
    });
    if let Some(system) = &prompt.system
        && let Some(obj) = payload.as_object_mut()
    {
        obj.insert("system".to_string(), Value::String(system.clone()));
    }
    payload
}

#[derive(Debug, Clone)]
struct ToolUse {
    id: String,
    name: String,
    input: Value,
}

#[derive(Debug, Default)]
struct TurnOutcome {
    text: String,
    tool_uses: Vec<ToolUse>,
    stop_reason: Option<String>,
}

/// Assistant message echoing the turn's text and tool_use blocks, required
/// by the protocol before the matching tool_result message.
fn assistant_turn_message(turn: &TurnOutcome) -> Value {
    let mut content = Vec::new();
    if !turn.text.is_empty() {
        content.push(json!({"type": "text", "text": turn.text}));
    }
    for tool_use in &turn.tool_uses {
        content.push(json!({
            "type": "tool_use",
            "id": tool_use.id,
            "name": tool_use.name,
            "input": tool_use.input,
        }));
    }
    json!({"role": "assistant", "content": content})
}

#[derive(Debug, Deserialize)]
struct SseEvent {
    #[serde(rename = "type")]
    kind: String,
    index: Option<usize>,
    message: Option<MessageStart>,
    content_block: Option<Value>,
    delta: Option<Value>,
    usage: Option<UsageDelta>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    usage: Option<UsageDelta>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// In-progress tool_use block: the input arrives as a stream of
/// `input_json_delta` fragments that only parse once the block stops.
#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    partial_json: String,
}

async fn consume_turn<S>(
    stream: S,
    events: &mpsc::Sender<AdapterEvent>,
    cancel: &CancellationToken,
    tokens: &mut TokenUsage,
) -> Result<TurnOutcome, ClassifiedError>
where
    S: Stream<Item = Result<Bytes, GatewayErr>> + Unpin,
{
    let mut stream = stream.eventsource();
    let idle_timeout: Duration = *GATEWAY_STREAM_IDLE_TIMEOUT_MS;

    let mut turn = TurnOutcome::default();
    let mut pending: Vec<(usize, PendingToolUse)> = Vec::new();
    let mut saw_stop = false;

    loop {
        let next = tokio::select! {
            next = timeout(idle_timeout, stream.next()) => next,
            _ = cancel.cancelled() => return Err(ClassifiedError::cancelled()),
        };

        let sse = match next {
            Ok(Some(Ok(sse))) => sse,
            Ok(Some(Err(e))) => return Err(GatewayErr::Stream(e.to_string()).into()),
            Ok(None) => break,
            Err(_) => return Err(ClassifiedError::timeout()),
        };

        let event: SseEvent = match serde_json::from_str(&sse.data) {
            Ok(event) => event,
            Err(e) => {
                debug!("failed to parse SSE event: {e}, data: {}", &sse.data);
                continue;
            }
        };

        match event.kind.as_str() {
            "message_start" => {
                if let Some(usage) = event.message.and_then(|m| m.usage) {
                    merge_usage(tokens, usage);
                }
            }
            "content_block_start" => {
                let Some(block) = event.content_block else { continue };
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let id = block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    pending.push((
                        event.index.unwrap_or(pending.len()),
                        PendingToolUse {
                            id,
                            name,
                            partial_json: String::new(),
                        },
                    ));
                }
            }
            "content_block_delta" => {
                let Some(delta) = event.delta else { continue };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            turn.text.push_str(text);
                            let _ = events
                                .send(AdapterEvent::Delta {
                                    text: text.to_string(),
                                })
                                .await;
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(fragment) = delta.get("partial_json").and_then(Value::as_str)
                            && let Some(index) = event.index
                            && let Some((_, tool_use)) =
                                pending.iter_mut().find(|(i, _)| *i == index)
                        {
                            tool_use.partial_json.push_str(fragment);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(index) = event.index
                    && let Some(position) = pending.iter().position(|(i, _)| *i == index)
                {
                    let (_, tool_use) = pending.remove(position);
                    let input = if tool_use.partial_json.is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&tool_use.partial_json).unwrap_or(Value::Null)
                    };
                    turn.tool_uses.push(ToolUse {
                        id: tool_use.id,
                        name: tool_use.name,
                        input,
                    });
                }
            }
            "message_delta" => {
                if let Some(delta) = event.delta
                    && let Some(stop_reason) = delta.get("stop_reason").and_then(Value::as_str)
                {
                    turn.stop_reason = Some(stop_reason.to_string());
                }
                if let Some(usage) = event.usage {
                    merge_usage(tokens, usage);
                }
            }
            "message_stop" => {
                saw_stop = true;
            }
            "error" => {
                let message = event
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "model backend reported an error".to_string());
                return Err(crate::classifier::classify(&message, None));
            }
            "ping" => {}
            other => debug!(other, "sse event"),
        }
    }

    if !saw_stop && turn.text.is_empty() && turn.tool_uses.is_empty() {
        return Err(GatewayErr::Stream("stream closed before message_stop".to_string()).into());
    }
    Ok(turn)
}

/// Execute one tool call through the sandbox. Tool failures become error
/// results the model can react to; only cancellation aborts the turn.
async fn execute_tool(
    sandbox: &Arc<ToolSandbox>,
    tool_use: &ToolUse,
    cancel: &CancellationToken,
) -> Result<(String, bool), ClassifiedError> {
    if cancel.is_cancelled() {
        return Err(ClassifiedError::cancelled());
    }

    let input = &tool_use.input;
    let str_arg = |key: &str| {
        input
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("missing required argument `{key}`"))
    };
    let bool_arg = |key: &str| input.get(key).and_then(Value::as_bool).unwrap_or(false);

    let outcome: Result<String, String> = match tool_use.name.as_str() {
        "read_file" => match str_arg("path") {
            Ok(path) => sandbox
                .read_file(&path)
                .await
                .map(|out| out.content)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        },
        "write_file" => match (str_arg("path"), str_arg("content")) {
            (Ok(path), Ok(content)) => sandbox
                .write_file(&path, &content)
                .await
                .map(|out| format!("wrote {} bytes to {path}", out.size))
                .map_err(|e| e.to_string()),
            (Err(e), _) | (_, Err(e)) => Err(e),
        },
        "list_directory" => match str_arg("path") {
            Ok(path) => sandbox
                .list_directory(&path, bool_arg("recursive"))
                .await
                .map(|entries| entries.join("\n"))
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        },
        "execute_shell" => match str_arg("command") {
            Ok(command) => match sandbox.execute_shell(&command, cancel).await {
                Ok(out) => {
                    if out.exit_code == 0 {
                        Ok(out.stdout)
                    } else {
                        Err(format!(
                            "exit code {}\nstdout:\n{}\nstderr:\n{}",
                            out.exit_code, out.stdout, out.stderr
                        ))
                    }
                }
                Err(crate::error::GatewayErr::Cancelled) => {
                    return Err(ClassifiedError::cancelled());
                }
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e),
        },
        "delete_path" => match str_arg("path") {
            Ok(path) => sandbox
                .delete_path(&path, bool_arg("recursive"))
                .await
                .map(|()| format!("deleted {path}"))
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        },
        "move_path" => match (str_arg("from"), str_arg("to")) {
            (Ok(from), Ok(to)) => sandbox
                .move_path(&from, &to)
                .await
                .map(|()| format!("moved {from} to {to}"))
                .map_err(|e| e.to_string()),
            (Err(e), _) | (_, Err(e)) => Err(e),
        },
        "apply_patch" => match str_arg("patch") {
            Ok(patch) => sandbox
                .apply_patch(&patch)
                .await
                .map(|()| "patch applied".to_string())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        },
        other => Err(format!("unknown tool: {other}")),
    };

    Ok(match outcome {
        Ok(output) => (output, false),
        Err(message) => (message, true),
    })
}
