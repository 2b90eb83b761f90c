//! Interchangeable model backends behind one streaming contract.
//!
//! The selector tries adapters in a configured order, skipping those whose
//! `can_handle` declines the context and falling through on failure. Only
//! cancellation short-circuits the cascade; any other error moves on to the
//! next backend and the last one is surfaced when none succeed.

pub mod http_api;
pub mod remote;
pub mod sdk;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::classifier::ClassifiedError;
use crate::classifier::ErrorCode;
use crate::models::AdapterContext;
use crate::models::AdapterEvent;
use crate::models::AdapterMessage;
use crate::models::AdapterResult;
use crate::prompt::ComposedPrompt;
use crate::util::estimate_tokens;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Sdk,
    HttpApi,
    RemoteConversation,
}

#[async_trait]
pub trait ModelAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    fn can_handle(&self, ctx: &AdapterContext) -> bool;

    /// Drive one model turn. Events are pushed to `events` as they happen;
    /// the cancellation token is checked between stream chunks and observing
    /// it must surface `cancelled`.
    async fn run(
        &self,
        prompt: &ComposedPrompt,
        input: &[AdapterMessage],
        ctx: &AdapterContext,
        events: &mpsc::Sender<AdapterEvent>,
        cancel: &CancellationToken,
    ) -> Result<AdapterResult, ClassifiedError>;
}

pub struct RuntimeSelector {
    adapters: Vec<Arc<dyn ModelAdapter>>,
}

impl RuntimeSelector {
    pub fn new_default() -> Self {
        Self {
            adapters: vec![
                Arc::new(sdk::SdkAdapter::new()),
                Arc::new(http_api::HttpApiAdapter::new()),
                Arc::new(remote::RemoteConversationAdapter::new()),
            ],
        }
    }

    pub fn with_adapters(adapters: Vec<Arc<dyn ModelAdapter>>) -> Self {
        Self { adapters }
    }

    /// Stable reorder: when the process runs as root (no local tooling can
    /// be trusted) or the HTTP backend is forced, it moves to the front;
    /// relative order is otherwise preserved.
    fn ordered(&self, ctx: &AdapterContext) -> Vec<Arc<dyn ModelAdapter>> {
        let mut ordered = self.adapters.clone();
        if ctx.running_as_root || ctx.force_http_api {
            ordered.sort_by_key(|adapter| adapter.kind() != AdapterKind::HttpApi);
        }
        ordered
    }

    pub async fn run(
        &self,
        prompt: &ComposedPrompt,
        input: &[AdapterMessage],
        ctx: &AdapterContext,
        events: &mpsc::Sender<AdapterEvent>,
        cancel: &CancellationToken,
    ) -> Result<AdapterResult, ClassifiedError> {
        let candidates: Vec<Arc<dyn ModelAdapter>> = self
            .ordered(ctx)
            .into_iter()
            .filter(|adapter| adapter.can_handle(ctx))
            .collect();

        if candidates.is_empty() {
            return Err(ClassifiedError::new(
                ErrorCode::Unknown,
                "no model backend is available for this context",
            ));
        }

        let mut last_error: Option<ClassifiedError> = None;
        for adapter in candidates {
            if cancel.is_cancelled() {
                return Err(ClassifiedError::cancelled());
            }
            match adapter.run(prompt, input, ctx, events, cancel).await {
                Ok(result) => return Ok(fill_usage_estimates(result, prompt, input)),
                Err(err) if err.code == ErrorCode::Cancelled => return Err(err),
                Err(err) => {
                    warn!(kind = ?adapter.kind(), error = %err, "adapter failed, trying next");
                    last_error = Some(err);
                }
            }
        }

        // `candidates` was non-empty, so at least one error was recorded.
        Err(last_error.unwrap_or_else(|| {
            ClassifiedError::new(ErrorCode::Unknown, "all model backends failed")
        }))
    }
}

/// When the backend reported nothing, fall back to the 4-chars-per-token
/// estimate over the prompt (input) and the produced text (output).
fn fill_usage_estimates(
    mut result: AdapterResult,
    prompt: &ComposedPrompt,
    input: &[AdapterMessage],
) -> AdapterResult {
    if result.tokens.input == 0 {
        result.tokens.input = if input.is_empty() {
            prompt.estimated_tokens
        } else {
            let queued: u64 = input.iter().map(|m| estimate_tokens(&m.text())).sum();
            queued.max(1)
        };
    }
    if result.tokens.output == 0 && !result.full_text.is_empty() {
        result.tokens.output = estimate_tokens(&result.full_text);
    }
    result
}
