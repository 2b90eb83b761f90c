//! Direct HTTP adapter: POSTs to the messages endpoint with `stream: true`
//! and forwards text deltas as they arrive. No tool use.

use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::adapters::AdapterKind;
use crate::adapters::ModelAdapter;
use crate::classifier::ClassifiedError;
use crate::classifier::ErrorCode;
use crate::error::GatewayErr;
use crate::flags::ANTHROPIC_API_BASE;
use crate::flags::ANTHROPIC_VERSION;
use crate::flags::GATEWAY_REQUEST_MAX_RETRIES;
use crate::flags::GATEWAY_SSE_FIXTURE;
use crate::flags::GATEWAY_STREAM_IDLE_TIMEOUT_MS;
use crate::models::AdapterContext;
use crate::models::AdapterEvent;
use crate::models::AdapterMessage;
use crate::models::AdapterResult;
use crate::models::TokenUsage;
use crate::models::resolve_model;
use crate::prompt::ComposedPrompt;
use crate::util::backoff;
use gateway_protocol::Role;

const MAX_TOKENS: u64 = 8192;

pub struct HttpApiAdapter {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpApiAdapter {
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

impl Default for HttpApiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ModelAdapter for HttpApiAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::HttpApi
    }

    fn can_handle(&self, ctx: &AdapterContext) -> bool {
        ctx.api_key.is_some() || GATEWAY_SSE_FIXTURE.is_some()
    }

    async fn run(
        &self,
        prompt: &ComposedPrompt,
        input: &[AdapterMessage],
        ctx: &AdapterContext,
        events: &mpsc::Sender<AdapterEvent>,
        cancel: &CancellationToken,
    ) -> Result<AdapterResult, ClassifiedError> {
        if let Some(path) = *GATEWAY_SSE_FIXTURE {
            warn!(path, "streaming from fixture");
            let stream = fixture_stream(path).map_err(ClassifiedError::from)?;
            let _ = events.send(AdapterEvent::Started).await;
            return consume_text_stream(stream, events, cancel).await;
        }

        let payload = build_payload(prompt, input, ctx);
        let api_key = ctx.api_key.clone().unwrap_or_default();
        let url = format!("{}/v1/messages", self.api_base());
        debug!(url, "POST");

        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(ClassifiedError::cancelled());
            }

            let request = self
                .client
                .post(&url)
                .header("x-api-key", &api_key)
                .header("anthropic-version", *ANTHROPIC_VERSION)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(&payload)
                .send();

            let res = tokio::select! {
                res = request => res,
                _ = cancel.cancelled() => return Err(ClassifiedError::cancelled()),
            };

            match res {
                Ok(resp) if resp.status().is_success() => {
                    let stream = resp.bytes_stream().map_err(GatewayErr::Reqwest);
                    let _ = events.send(AdapterEvent::Started).await;
                    return consume_text_stream(stream, events, cancel).await;
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

                    let retry_after_secs = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok());
                    let delay = retry_after_secs
                        .map(|s| Duration::from_millis(s * 1_000))
                        .unwrap_or_else(|| backoff(attempt));
                    tokio::time::sleep(delay).await;
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

fn build_payload(prompt: &ComposedPrompt, input: &[AdapterMessage], ctx: &AdapterContext) -> Value {
    let mut messages: Vec<Value> = input
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            json!({"role": role, "content": message.text()})
        })
        .collect();
    // The composed prompt is the final user message unless the caller already
    // queued it (replay paths pass the prompt as the queue's tail).
    if messages.is_empty() {
        messages.push(json!({"role": "user", "content": prompt.body}));
    }

    let mut payload = json!({
        "model": resolve_model(ctx.model.as_deref()),
        "max_tokens": MAX_TOKENS,
        "messages": messages,
        "stream": true,
    });
    if let Some(system) = &prompt.system
        && let Some(obj) = payload.as_object_mut()
    {
        obj.insert("system".to_string(), Value::String(system.clone()));
    }
    payload
}

#[derive(Debug, Deserialize)]
struct SseEvent {
    #[serde(rename = "type")]
    kind: String,
    message: Option<MessageStart>,
    delta: Option<Value>,
    usage: Option<UsageDelta>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    usage: Option<UsageDelta>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
pub(crate) struct UsageDelta {
    pub(crate) input_tokens: Option<u64>,
    pub(crate) output_tokens: Option<u64>,
    pub(crate) cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// Drain an SSE stream of `content_block_delta` text events, forwarding each
/// delta and accumulating the full text. A silent stream trips the stall
/// detector and the turn fails with `timeout`.
pub(crate) async fn consume_text_stream<S>(
    stream: S,
    events: &mpsc::Sender<AdapterEvent>,
    cancel: &CancellationToken,
) -> Result<AdapterResult, ClassifiedError>
where
    S: Stream<Item = Result<Bytes, GatewayErr>> + Unpin,
{
    let mut stream = stream.eventsource();
    let idle_timeout = *GATEWAY_STREAM_IDLE_TIMEOUT_MS;
    let started = Instant::now();

    let mut full_text = String::new();
    let mut tokens = TokenUsage::default();
    let mut completed = false;

    loop {
        let next = tokio::select! {
            next = timeout(idle_timeout, stream.next()) => next,
            _ = cancel.cancelled() => return Err(ClassifiedError::cancelled()),
        };

        let sse = match next {
            Ok(Some(Ok(sse))) => sse,
            Ok(Some(Err(e))) => {
                debug!("SSE error: {e:#}");
                return Err(GatewayErr::Stream(e.to_string()).into());
            }
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
                    merge_usage(&mut tokens, usage);
                }
            }
            "content_block_delta" => {
                let Some(delta) = event.delta else { continue };
                if delta.get("type").and_then(Value::as_str) == Some("text_delta")
                    && let Some(text) = delta.get("text").and_then(Value::as_str)
                {
                    full_text.push_str(text);
                    let _ = events
                        .send(AdapterEvent::Delta {
                            text: text.to_string(),
                        })
                        .await;
                }
            }
            "message_delta" => {
                if let Some(usage) = event.usage {
                    merge_usage(&mut tokens, usage);
                }
            }
            "message_stop" => {
                completed = true;
            }
            "error" => {
                let message = event
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "model backend reported an error".to_string());
                return Err(crate::classifier::classify(&message, None));
            }
            "ping" | "content_block_start" | "content_block_stop" => {}
            other => debug!(other, "sse event"),
        }
    }

    if !completed && full_text.is_empty() {
        return Err(GatewayErr::Stream("stream closed before message_stop".to_string()).into());
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

pub(crate) fn merge_usage(tokens: &mut TokenUsage, usage: UsageDelta) {
    if let Some(input) = usage.input_tokens {
        tokens.input = input;
    }
    if let Some(output) = usage.output_tokens {
        tokens.output = output;
    }
    if let Some(cache_read) = usage.cache_read_input_tokens {
        tokens.cache_read = Some(cache_read);
    }
    if tokens.input > 0 || tokens.output > 0 {
        tokens.total = Some(tokens.input + tokens.output);
    }
}

/// Stream canned SSE bytes from a fixture file through the real parser.
/// Each line of the file becomes one SSE frame.
fn fixture_stream(
    path: &str,
) -> Result<impl Stream<Item = Result<Bytes, GatewayErr>> + Unpin, GatewayErr> {
    use std::io::BufRead;
    let file = std::fs::File::open(path)?;
    let mut content = String::new();
    for line in std::io::BufReader::new(file).lines() {
        content.push_str(&line?);
        content.push_str("\n\n");
    }
    let reader = std::io::Cursor::new(content);
    Ok(ReaderStream::new(reader).map_err(GatewayErr::Io))
}
