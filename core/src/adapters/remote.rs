//! Remote conversation adapter: creates a conversation on an external
//! service and polls it to completion. No streaming connection is held open,
//! so this is the backend of last resort.

use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapters::AdapterKind;
use crate::adapters::ModelAdapter;
use crate::classifier::ClassifiedError;
use crate::classifier::ErrorCode;
use crate::error::GatewayErr;
use crate::flags::GATEWAY_REMOTE_BASE_URL;
use crate::flags::GATEWAY_REMOTE_TIMEOUT_MS;
use crate::models::AdapterContext;
use crate::models::AdapterEvent;
use crate::models::AdapterMessage;
use crate::models::AdapterResult;
use crate::models::TokenUsage;
use crate::models::resolve_model;
use crate::prompt::ComposedPrompt;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Consecutive poll failures tolerated before the run is abandoned.
const MAX_POLL_FAILURES: u32 = 3;

#[derive(Debug, Deserialize)]
struct CreatedConversation {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ConversationEvents {
    #[serde(default)]
    events: Vec<RemoteEvent>,
    status: String,
    #[serde(default)]
    full_text: Option<String>,
    #[serde(default)]
    cursor: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    usage: Option<RemoteUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RemoteEvent {
    Delta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, Clone, Copy)]
struct RemoteUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

pub struct RemoteConversationAdapter {
    client: reqwest::Client,
}

impl RemoteConversationAdapter {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for RemoteConversationAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ModelAdapter for RemoteConversationAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::RemoteConversation
    }

    fn can_handle(&self, ctx: &AdapterContext) -> bool {
        ctx.remote_base_url.is_some() || GATEWAY_REMOTE_BASE_URL.is_some()
    }

    async fn run(
        &self,
        prompt: &ComposedPrompt,
        input: &[AdapterMessage],
        ctx: &AdapterContext,
        events: &mpsc::Sender<AdapterEvent>,
        cancel: &CancellationToken,
    ) -> Result<AdapterResult, ClassifiedError> {
        let base = ctx
            .remote_base_url
            .clone()
            .or_else(|| GATEWAY_REMOTE_BASE_URL.map(str::to_string))
            .ok_or_else(|| {
                ClassifiedError::new(ErrorCode::Unknown, "remote service is not configured")
            })?;
        let base = base.trim_end_matches('/').to_string();

        // Replayed history travels inline; the service holds no session state
        // for us.
        let transcript: Vec<_> = input
            .iter()
            .map(|message| {
                json!({
                    "role": match message.role {
                        gateway_protocol::Role::User => "user",
                        gateway_protocol::Role::Assistant => "assistant",
                    },
                    "text": message.text(),
                })
            })
            .collect();

        let create = self
            .client
            .post(format!("{base}/v1/conversations"))
            .json(&json!({
                "model": resolve_model(ctx.model.as_deref()),
                "prompt": prompt.text,
                "system": prompt.system,
                "transcript": transcript,
            }))
            .send();
        let created = tokio::select! {
            res = create => res,
            _ = cancel.cancelled() => return Err(ClassifiedError::cancelled()),
        };
        let created = created.map_err(GatewayErr::Reqwest)?;
        if !created.status().is_success() {
            let status = created.status();
            let body = created.text().await.unwrap_or_default();
            return Err(GatewayErr::UnexpectedStatus(status, body).into());
        }
        let conversation: CreatedConversation =
            created.json().await.map_err(GatewayErr::Reqwest)?;
        debug!(id = %conversation.id, "remote conversation created");

        let _ = events.send(AdapterEvent::Started).await;
        let started = Instant::now();
        let budget: Duration = *GATEWAY_REMOTE_TIMEOUT_MS;

        let mut full_text = String::new();
        let mut tokens = TokenUsage::default();
        let mut cursor = 0u64;
        let mut consecutive_failures = 0u32;

        loop {
            if started.elapsed() > budget {
                return Err(ClassifiedError::timeout());
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(ClassifiedError::cancelled()),
            }

            let poll = self
                .client
                .get(format!(
                    "{base}/v1/conversations/{}/events",
                    conversation.id
                ))
                .query(&[("cursor", cursor)])
                .send()
                .await;

            let page: ConversationEvents = match poll {
                Ok(resp) if resp.status().is_success() => match resp.json().await {
                    Ok(page) => page,
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures > MAX_POLL_FAILURES {
                            return Err(GatewayErr::Reqwest(e).into());
                        }
                        continue;
                    }
                },
                Ok(resp) => {
                    consecutive_failures += 1;
                    if consecutive_failures > MAX_POLL_FAILURES {
                        let status = resp.status();
                        let body = resp.text().await.unwrap_or_default();
                        return Err(GatewayErr::UnexpectedStatus(status, body).into());
                    }
                    continue;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures > MAX_POLL_FAILURES {
                        return Err(GatewayErr::Reqwest(e).into());
                    }
                    continue;
                }
            };
            consecutive_failures = 0;

            for event in &page.events {
                if let RemoteEvent::Delta { text } = event {
                    full_text.push_str(text);
                    let _ = events
                        .send(AdapterEvent::Delta {
                            text: text.clone(),
                        })
                        .await;
                }
            }
            if let Some(next_cursor) = page.cursor {
                cursor = next_cursor;
            } else {
                cursor += page.events.len() as u64;
            }
            if let Some(usage) = page.usage {
                tokens.input = usage.input_tokens;
                tokens.output = usage.output_tokens;
            }

            match page.status.as_str() {
                "completed" => {
                    if let Some(text) = page.full_text
                        && full_text.is_empty()
                    {
                        full_text = text;
                    }
                    let _ = events
                        .send(AdapterEvent::Completed {
                            full_text: full_text.clone(),
                            duration_ms: started.elapsed().as_millis() as u64,
                        })
                        .await;
                    return Ok(AdapterResult {
                        full_text,
                        tokens,
                        cost: None,
                    });
                }
                "failed" => {
                    let message = page
                        .error
                        .unwrap_or_else(|| "remote conversation failed".to_string());
                    return Err(crate::classifier::classify(&message, None));
                }
                _ => {}
            }
        }
    }
}
