//! Context window budgeting
//!
//! Before each provider call the previous request's token count plus an
//! estimate for the newest message is compared with the model's budget.
//! Past the budget, the oldest half of the conversation after the first
//! message is dropped, keeping tool invocations and their results together.

use std::collections::HashSet;

use strand_ai::{ContentBlock, Message, MessageContent, ModelInfo, ToolResultContent};

/// Share of the context window kept free as a safety margin
pub const TOKEN_BUFFER_PERCENTAGE: f64 = 0.1;

/// Share of the conversation removed by one truncation
pub const DEFAULT_TRUNCATION_FRACTION: f64 = 0.5;

const IMAGE_CHARS: usize = 4800;

/// Estimate token count for a single message (chars/4 heuristic)
pub fn estimate_tokens(message: &Message) -> u64 {
    let chars = match &message.content {
        MessageContent::Text(text) => text.len(),
        MessageContent::Blocks(blocks) => blocks.iter().map(block_chars).sum(),
    };
    (chars / 4) as u64
}

fn block_chars(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text, .. } => text.len(),
        ContentBlock::Image(_) => IMAGE_CHARS,
        ContentBlock::ToolUse { name, params, .. } => {
            name.len() + serde_json::to_string(params).unwrap_or_default().len()
        }
        ContentBlock::ToolResult { content, .. } => content
            .iter()
            .map(|c| match c {
                ToolResultContent::Text { text } => text.len(),
                ToolResultContent::Image(_) => IMAGE_CHARS,
            })
            .sum(),
    }
}

/// Tokens a request may use, leaving room for the buffer and the output
pub fn allowed_tokens(model: &ModelInfo) -> u64 {
    let window = model.context_window as f64 * (1.0 - TOKEN_BUFFER_PERCENTAGE);
    (window as u64).saturating_sub(model.reserved_output_tokens() as u64)
}

/// Whether the next call would exceed the budget.
///
/// `previous_total` is everything the previous request counted (input,
/// output and cache tokens); `newest` is the message about to be sent.
pub fn needs_truncation(previous_total: u64, newest: Option<&Message>, model: &ModelInfo) -> bool {
    let effective = previous_total + newest.map(estimate_tokens).unwrap_or(0);
    effective > allowed_tokens(model)
}

/// Drop about `fraction` of the messages after the first one.
///
/// The count removed is even so user/assistant alternation survives, the
/// newest message is always kept, and the cut moves earlier while it would
/// leave a tool result whose invocation was removed.
pub fn truncate_conversation(messages: &[Message], fraction: f64) -> Vec<Message> {
    if messages.len() < 3 {
        return messages.to_vec();
    }

    let raw = ((messages.len() - 1) as f64 * fraction.clamp(0.0, 1.0)).floor() as usize;
    let mut remove = raw.min(messages.len() - 2);
    remove -= remove % 2;

    while remove > 0 && leaves_orphan(messages, remove) {
        remove -= 1;
    }

    let mut truncated = Vec::with_capacity(messages.len() - remove);
    truncated.push(messages[0].clone());
    truncated.extend_from_slice(&messages[1 + remove..]);
    truncated
}

/// Whether removing `messages[1..1 + remove]` strands a tool result
fn leaves_orphan(messages: &[Message], remove: usize) -> bool {
    let kept = std::iter::once(&messages[0]).chain(&messages[1 + remove..]);
    let mut uses = HashSet::new();
    for message in kept {
        for id in message.tool_result_ids() {
            if !uses.contains(id) {
                return true;
            }
        }
        uses.extend(message.tool_use_ids());
    }
    false
}

/// Truncated history when the next call would not fit, else `None`
pub fn manage(history: &[Message], previous_total: u64, model: &ModelInfo) -> Option<Vec<Message>> {
    if !needs_truncation(previous_total, history.last(), model) {
        return None;
    }
    let truncated = truncate_conversation(history, DEFAULT_TRUNCATION_FRACTION);
    (truncated.len() < history.len()).then_some(truncated)
}
