//! Replay of stored history into a model's input queue.
//!
//! Stored exchanges may contain blocks that only made sense to the backend
//! that produced them (tool invocations and their outputs carry provider
//! call ids that a fresh conversation cannot reference). Rehydration
//! sanitizes each exchange down to content the model can always accept and
//! replays only the most recent window.

use gateway_protocol::ContentBlock;
use gateway_protocol::Exchange;

use crate::models::AdapterMessage;

/// Number of trailing exchanges replayed into a resumed conversation.
pub const DEFAULT_REPLAY_WINDOW: usize = 30;

/// Keep only block kinds that are valid model input. Everything else —
/// thoughts, error markers, tool traffic from previous runs — is dropped.
pub fn sanitize_exchange(exchange: &Exchange) -> Option<Exchange> {
    let content: Vec<ContentBlock> = exchange
        .content
        .iter()
        .filter(|block| {
            matches!(
                block,
                ContentBlock::Text { .. }
                    | ContentBlock::Image { .. }
                    | ContentBlock::File { .. }
                    | ContentBlock::Diff { .. }
            )
        })
        .cloned()
        .collect();

    if content.is_empty() {
        return None;
    }
    Some(Exchange {
        role: exchange.role,
        content,
    })
}

/// Build the adapter input queue: the last `window` sanitized exchanges,
/// oldest first, followed by the new user prompt.
pub fn build_adapter_input(
    history: &[Exchange],
    window: usize,
    new_prompt: AdapterMessage,
) -> Vec<AdapterMessage> {
    let tail_start = history.len().saturating_sub(window);
    let mut input: Vec<AdapterMessage> = history[tail_start..]
        .iter()
        .filter_map(sanitize_exchange)
        .map(|exchange| AdapterMessage {
            role: exchange.role,
            content: exchange.content,
        })
        .collect();
    input.push(new_prompt);
    input
}
