//! Types shared by the runtime selector and its adapters.

use std::path::PathBuf;
use std::sync::Arc;

use gateway_protocol::ContentBlock;
use gateway_protocol::Role;
use serde::Serialize;
use serde_json::Value;

use crate::sandbox::ToolSandbox;

/// One message handed to a model backend. The orchestrator builds the input
/// queue from replayed history followed by the new user prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl AdapterMessage {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    /// Concatenated plain text of the message, for backends that take flat
    /// strings and for token estimation.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let Some(text) = block.as_text() {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }
}

/// Token accounting for one adapter run. Backend-reported when available,
/// estimated otherwise. Cache-read and total counts are vendor extensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostUsd {
    pub input_usd: f64,
    pub output_usd: f64,
    pub total_usd: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AdapterResult {
    pub full_text: String,
    pub tokens: TokenUsage,
    pub cost: Option<CostUsd>,
}

/// Stream events an adapter pushes while it runs. The orchestrator forwards
/// them as `session/update` notifications in arrival order.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Started,
    Delta {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    Completed {
        full_text: String,
        duration_ms: u64,
    },
}

/// Everything an adapter needs to decide whether it can run and to do so.
#[derive(Clone, Default)]
pub struct AdapterContext {
    pub api_key: Option<String>,
    pub workspace_path: Option<PathBuf>,
    pub model: Option<String>,
    pub running_as_root: bool,
    pub disable_streaming_sdk: bool,
    pub force_http_api: bool,
    pub remote_base_url: Option<String>,
    /// Sandbox for tool-capable adapters. Absent in conversation-only runs.
    pub sandbox: Option<Arc<ToolSandbox>>,
}

/// Resolve the model identifier for a run. Ids that already carry a version
/// namespace (a `/`-qualified provider or a dated suffix) pass through
/// unchanged; short aliases map through a fixed table; anything else falls
/// back to the configured default.
pub fn resolve_model(requested: Option<&str>) -> String {
    let default_model = || crate::flags::GATEWAY_DEFAULT_MODEL.to_string();
    let Some(requested) = requested else {
        return default_model();
    };
    if requested.contains('/') || requested.contains(':') {
        return requested.to_string();
    }
    match requested {
        "sonnet" => "claude-sonnet-4-20250514".to_string(),
        "opus" => "claude-opus-4-20250514".to_string(),
        "haiku" => "claude-3-5-haiku-20241022".to_string(),
        other if other.starts_with("claude-") => other.to_string(),
        _ => default_model(),
    }
}
