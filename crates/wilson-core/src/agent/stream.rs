//! Response-stream consumption for the agent loop.
//!
//! Drains one backend stream into an accumulated outcome, forwarding
//! [`LoopEvent`]s as chunks arrive. Server-executed tool results are kept
//! aside keyed by tool_use_id; the first writer for an id wins when client
//! execution would produce a second result.

use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::ai::sse::StreamEvent;
use crate::ai::types::{ContentBlock, ToolRequest, Usage};

use super::loop_events::LoopEvent;

/// Everything one model response produced.
#[derive(Default)]
pub(crate) struct StreamOutcome {
    /// Accumulated text deltas (display form).
    pub text: String,
    /// Complete assistant content blocks for this turn.
    pub content: Vec<ContentBlock>,
    /// Tools the model wants executed.
    pub tools: Vec<ToolRequest>,
    /// Server-executed results by tool_use_id (first writer wins).
    pub server_results: HashMap<String, (Value, bool)>,
    pub usage: Usage,
    /// Set when the stream terminated with an error.
    pub error: Option<String>,
}

pub(crate) async fn consume(
    mut rx: mpsc::UnboundedReceiver<StreamEvent>,
    event_tx: &mpsc::UnboundedSender<LoopEvent>,
) -> StreamOutcome {
    let mut outcome = StreamOutcome::default();
    let mut saw_terminal = false;

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Text { text } => {
                outcome.text.push_str(&text);
                let _ = event_tx.send(LoopEvent::TextDelta { delta: text });
            }
            StreamEvent::Tool { name, id, .. } => {
                let _ = event_tx.send(LoopEvent::ToolAnnounced { name, id });
            }
            StreamEvent::ToolsPending {
                content, tools, ..
            } => {
                outcome.content = content;
                outcome.tools = tools;
            }
            StreamEvent::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let is_error = is_error.unwrap_or(false);
                if outcome.server_results.contains_key(&tool_use_id) {
                    tracing::debug!(%tool_use_id, "duplicate server tool result ignored");
                } else {
                    let _ = event_tx.send(LoopEvent::ToolResult {
                        id: tool_use_id.clone(),
                        output: summary_of(&content),
                        is_error,
                    });
                    outcome
                        .server_results
                        .insert(tool_use_id, (content, is_error));
                }
            }
            StreamEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                outcome.usage = Usage {
                    input_tokens,
                    output_tokens,
                };
                let _ = event_tx.send(LoopEvent::Usage {
                    input_tokens,
                    output_tokens,
                });
            }
            StreamEvent::Error { message } => {
                outcome.error = Some(message);
                saw_terminal = true;
                break;
            }
            StreamEvent::Done => {
                saw_terminal = true;
                break;
            }
        }
    }

    if !saw_terminal {
        outcome.error = Some("stream closed unexpectedly".to_string());
    }

    // Without tools_pending the accumulated text is the whole turn.
    if outcome.content.is_empty() && !outcome.text.is_empty() {
        outcome.content = vec![ContentBlock::text(outcome.text.clone())];
    }

    outcome
}

fn summary_of(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel_of(events: Vec<StreamEvent>) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            tx.send(event).unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn accumulates_text_until_done() {
        let rx = channel_of(vec![
            StreamEvent::Text { text: "he".into() },
            StreamEvent::Text { text: "llo".into() },
            StreamEvent::Done,
        ]);
        let (tx, mut events) = mpsc::unbounded_channel();
        let outcome = consume(rx, &tx).await;

        assert_eq!(outcome.text, "hello");
        assert!(outcome.error.is_none());
        assert_eq!(outcome.content, vec![ContentBlock::text("hello")]);
        assert!(matches!(
            events.try_recv().unwrap(),
            LoopEvent::TextDelta { .. }
        ));
    }

    #[tokio::test]
    async fn tools_pending_supplies_canonical_content() {
        let blocks = vec![
            ContentBlock::text("running"),
            ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: "bash".into(),
                input: json!({"command": "ls"}),
            },
        ];
        let rx = channel_of(vec![
            StreamEvent::ToolsPending {
                content: blocks.clone(),
                tools: vec![ToolRequest {
                    id: "tu_1".into(),
                    name: "bash".into(),
                    input: json!({"command": "ls"}),
                }],
                iteration: None,
                total_tool_calls: None,
            },
            StreamEvent::Done,
        ]);
        let (tx, _events) = mpsc::unbounded_channel();
        let outcome = consume(rx, &tx).await;

        assert_eq!(outcome.content, blocks);
        assert_eq!(outcome.tools.len(), 1);
    }

    #[tokio::test]
    async fn first_server_result_wins() {
        let rx = channel_of(vec![
            StreamEvent::ToolResult {
                tool_use_id: "tu_1".into(),
                content: json!("first"),
                is_error: None,
            },
            StreamEvent::ToolResult {
                tool_use_id: "tu_1".into(),
                content: json!("second"),
                is_error: None,
            },
            StreamEvent::Done,
        ]);
        let (tx, _events) = mpsc::unbounded_channel();
        let outcome = consume(rx, &tx).await;
        assert_eq!(outcome.server_results["tu_1"].0, json!("first"));
    }

    #[tokio::test]
    async fn closed_channel_without_terminal_is_an_error() {
        let rx = channel_of(vec![StreamEvent::Text { text: "partial".into() }]);
        let (tx, _events) = mpsc::unbounded_channel();
        let outcome = consume(rx, &tx).await;
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn error_event_terminates() {
        let rx = channel_of(vec![StreamEvent::Error {
            message: "overloaded".into(),
        }]);
        let (tx, _events) = mpsc::unbounded_channel();
        let outcome = consume(rx, &tx).await;
        assert_eq!(outcome.error.as_deref(), Some("overloaded"));
    }
}
