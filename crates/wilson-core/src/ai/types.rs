//! Conversation and content-block types shared between the loop controller,
//! the tool runtime, and the streaming backend.
//!
//! Messages are flat arrays of tagged blocks; blocks reference each other by
//! id only (a `tool_result` names the `tool_use` id it answers). There is no
//! pointer graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Only produced by backends that execute tools server-side; the loop
    /// itself carries tool results on user-role messages.
    Tool,
}

/// Cache hint attached to a tool_result block sent back to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: String,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            kind: "ephemeral".to_string(),
        }
    }
}

/// One element of a structured message payload, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },

    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },

    /// Opaque to the core; carried through for the UI layer.
    Image {
        source: Value,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A complete tool invocation requested by the model: the wire form of a
/// `tool_use` block, before the runtime takes over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Lifecycle of a [`ToolCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

/// Runtime shadow of a `tool_use` block, tracked per call for display and
/// bookkeeping. Never serialized to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    /// Streamed output buffer for interactive display (bash etc.).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

impl ToolCall {
    pub fn pending(request: &ToolRequest) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            input: request.input.clone(),
            status: ToolCallStatus::Pending,
            result: None,
            elapsed_ms: None,
            output: String::new(),
        }
    }
}

/// Running input/output token counts reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A single conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub is_streaming: bool,
}

impl ChatMessage {
    pub fn new(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            blocks,
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            is_streaming: false,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self::new(Role::Assistant, blocks)
    }

    /// Concatenated text-block content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    /// Ids of every tool_use block in this message, in order.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Ids of every tool_result block in this message, in order.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Ordered message sequence plus a running token estimate.
///
/// Owned exclusively by the loop controller during an active send; handed
/// back (and to the UI) once the send resolves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<ChatMessage>,
    pub token_estimate: usize,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.token_estimate += estimate_message_tokens(&message);
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Recompute the estimate from scratch (after compaction).
    pub fn reestimate(&mut self) {
        self.token_estimate = self.messages.iter().map(estimate_message_tokens).sum();
    }
}

/// Conservative chars-per-token heuristic: ceil(len / 4) over the serialized
/// block content. Accuracy is not a goal; monotonicity is.
pub fn estimate_message_tokens(message: &ChatMessage) -> usize {
    let mut chars = 0usize;
    for block in &message.blocks {
        chars += match block {
            ContentBlock::Text { text } => text.len(),
            ContentBlock::ToolUse { name, input, .. } => name.len() + input.to_string().len(),
            ContentBlock::ToolResult { content, .. } => content.to_string().len(),
            ContentBlock::Image { .. } => 1_600, // flat charge per image
        };
    }
    chars.div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_block_round_trips_with_type_tag() {
        let block = ContentBlock::ToolUse {
            id: "tu_1".into(),
            name: "read".into(),
            input: json!({"path": "x"}),
        };
        let raw = serde_json::to_value(&block).unwrap();
        assert_eq!(raw["type"], "tool_use");
        let back: ContentBlock = serde_json::from_value(raw).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn tool_result_omits_absent_fields() {
        let block = ContentBlock::ToolResult {
            tool_use_id: "tu_1".into(),
            content: json!("ok"),
            is_error: None,
            cache_control: None,
        };
        let raw = serde_json::to_string(&block).unwrap();
        assert!(!raw.contains("is_error"));
        assert!(!raw.contains("cache_control"));
    }

    #[test]
    fn token_estimate_grows_with_content() {
        let mut conv = Conversation::new();
        conv.push(ChatMessage::user_text("hello"));
        let small = conv.token_estimate;
        conv.push(ChatMessage::user_text("a".repeat(4_000)));
        assert!(conv.token_estimate >= small + 1_000);
    }

    #[test]
    fn tool_use_and_result_ids_line_up() {
        let assistant = ChatMessage::assistant(vec![
            ContentBlock::text("on it"),
            ContentBlock::ToolUse {
                id: "tu_9".into(),
                name: "bash".into(),
                input: json!({"command": "ls"}),
            },
        ]);
        let results = ChatMessage::new(
            Role::User,
            vec![ContentBlock::ToolResult {
                tool_use_id: "tu_9".into(),
                content: json!("files"),
                is_error: None,
                cache_control: None,
            }],
        );
        assert_eq!(assistant.tool_use_ids(), results.tool_result_ids());
    }
}
