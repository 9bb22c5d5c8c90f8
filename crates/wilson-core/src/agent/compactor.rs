//! Conversation compaction.
//!
//! Keeps the history handed to the backend under the model window. Recent
//! turns survive verbatim; older turns are reduced to synopses (the intent
//! text plus the tool names invoked) with tool_use inputs dropped and
//! tool_result payloads summarized. The tool_use ↔
//! tool_result pairing is never broken: blocks are shrunk in place, never
//! removed.
//!
//! Every transform is idempotent, so re-running the compactor on an already
//! compacted conversation changes nothing.

use serde_json::Value;

use crate::ai::types::{ChatMessage, ContentBlock, Conversation, Role};

const SYNOPSIS_MAX_BYTES: usize = 160;

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Compact once the estimate crosses this line (default well under the
    /// ~200k model window).
    pub threshold_tokens: usize,
    /// Whole turns preserved verbatim at the tail.
    pub keep_recent_turns: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold_tokens: 150_000,
            keep_recent_turns: 10,
        }
    }
}

/// Observability record for one compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    pub compacted: bool,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

pub struct Compactor {
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    pub fn compact(&self, conversation: &mut Conversation) -> CompactionReport {
        conversation.reestimate();
        let tokens_before = conversation.token_estimate;

        if tokens_before < self.config.threshold_tokens {
            return CompactionReport {
                compacted: false,
                tokens_before,
                tokens_after: tokens_before,
            };
        }

        let boundary = self.preserved_boundary(&conversation.messages);
        for message in &mut conversation.messages[..boundary] {
            compact_message(message);
        }

        conversation.reestimate();
        let tokens_after = conversation.token_estimate;
        tracing::info!(tokens_before, tokens_after, "conversation compacted");

        CompactionReport {
            compacted: true,
            tokens_before,
            tokens_after,
        }
    }

    /// Index of the first message that must survive verbatim. A turn starts
    /// at each user message that carries no tool results (tool-result
    /// messages belong to the turn of the assistant that requested them).
    fn preserved_boundary(&self, messages: &[ChatMessage]) -> usize {
        let mut turns = 0;
        for (index, message) in messages.iter().enumerate().rev() {
            if message.role == Role::User && message.tool_result_ids().is_empty() {
                turns += 1;
                if turns >= self.config.keep_recent_turns {
                    return index;
                }
            }
        }
        0
    }
}

fn compact_message(message: &mut ChatMessage) {
    // Tool names invoked in this turn survive into the synopsis. The call
    // records know them; decoded history without records falls back to the
    // retained tool_use blocks.
    let mut tool_names: Vec<String> = message.tool_calls.iter().map(|c| c.name.clone()).collect();
    if tool_names.is_empty() {
        tool_names = message
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
    }
    let tools_tag =
        (!tool_names.is_empty()).then(|| format!("[tools: {}]", tool_names.join(", ")));

    for block in &mut message.blocks {
        match block {
            ContentBlock::Text { .. } => {}
            ContentBlock::ToolUse { input, .. } => {
                // Input dropped entirely; the block stays so its result keeps
                // a referent.
                *input = Value::Object(serde_json::Map::new());
            }
            ContentBlock::ToolResult {
                content,
                cache_control,
                ..
            } => {
                *content = Value::String(synopsis(&content_text(content)));
                *cache_control = None;
            }
            ContentBlock::Image { .. } => {
                *block = ContentBlock::text("[image omitted]");
            }
        }
    }

    // The first text block carries the tag; a turn with no text at all gets
    // a text block holding just the tag.
    let mut tag = tools_tag.as_deref();
    for block in &mut message.blocks {
        if let ContentBlock::Text { text } = block {
            *text = match tag.take() {
                Some(tag) => tagged_synopsis(text, tag),
                None => synopsis(text),
            };
        }
    }
    if let Some(tag) = tag {
        message.blocks.insert(0, ContentBlock::text(tag));
    }
}

fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Synopsis plus the tool-name tag. An already-tagged text is stripped back
/// to its base first, so reapplying yields the same string.
fn tagged_synopsis(text: &str, tag: &str) -> String {
    let base = text.strip_suffix(tag).unwrap_or(text).trim_end();
    if base.is_empty() {
        return tag.to_string();
    }
    format!("{} {}", synopsis(base), tag)
}

/// Byte-bounded prefix, ellipsis-terminated. Applying it twice yields the
/// same string.
fn synopsis(text: &str) -> String {
    if text.len() <= SYNOPSIS_MAX_BYTES {
        return text.to_string();
    }
    let mut cut = SYNOPSIS_MAX_BYTES - '…'.len_utf8();
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}
