//! SSE stream decoder.
//!
//! The backend frames its response as `data: <json>\n` records. Each record
//! is one [`StreamEvent`], discriminated by a `type` field. Records that are
//! not valid JSON, or that carry an unknown tag, are skipped silently.
//!
//! Exactly one of `done` / `error` ends every stream. A stream that reaches
//! EOF without either is synthesized into `error("unexpected EOF")` by
//! [`SseDecoder::finish`]. The decoder is single-use: nothing is emitted
//! after the terminal event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ai::types::{ContentBlock, ToolRequest};

/// One decoded event from the backend stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A chunk of assistant text.
    Text { text: String },

    /// Partial tool-call announcement. UI progress only; the canonical tool
    /// list arrives with `tools_pending`.
    Tool {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },

    /// End-of-turn event when the model wants tools executed. Carries the
    /// complete assistant content blocks and the calls to run.
    ToolsPending {
        content: Vec<ContentBlock>,
        tools: Vec<ToolRequest>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_tool_calls: Option<u64>,
    },

    /// Result of a tool the backend executed on our behalf.
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    /// Running token counters.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },

    /// Terminates the stream with a failure.
    Error { message: String },

    /// Terminates the stream with success.
    Done,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }
}

/// Canonical encoder; [`SseDecoder`] is its right inverse for legal event
/// sequences. Used by test harnesses and the scripted backend.
pub fn encode(event: &StreamEvent) -> String {
    // StreamEvent serialization cannot fail: no non-string map keys, no
    // non-finite floats.
    let json = serde_json::to_string(event).unwrap_or_default();
    format!("data: {}\n", json)
}

/// Incremental `data:`-record decoder over a byte stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: String,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a terminal event has been emitted.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed a chunk of bytes, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        self.pending.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            if let Some(event) = decode_record(line.trim_end()) {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    self.finished = true;
                    break;
                }
            }
        }
        events
    }

    /// Signal EOF. Returns the synthesized error if the stream ended without
    /// a terminal event.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        tracing::warn!("stream ended without done or error");
        Some(StreamEvent::Error {
            message: "unexpected EOF".to_string(),
        })
    }
}

/// Decode one framed line. `None` for non-data lines, malformed JSON, and
/// unknown event tags.
fn decode_record(line: &str) -> Option<StreamEvent> {
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() {
        return None;
    }
    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(error = %e, "skipping malformed stream record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(input: &str) -> (Vec<StreamEvent>, Option<StreamEvent>) {
        let mut decoder = SseDecoder::new();
        let mut events = decoder.feed(input.as_bytes());
        let eof = decoder.finish();
        if let Some(ref e) = eof {
            events.push(e.clone());
        }
        (events, eof)
    }

    #[test]
    fn decodes_text_then_done() {
        let (events, eof) = decode_all(
            "data: {\"type\":\"text\",\"text\":\"hi\"}\ndata: {\"type\":\"done\"}\n",
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Text { text: "hi".into() },
                StreamEvent::Done
            ]
        );
        assert!(eof.is_none());
    }

    #[test]
    fn reassembles_split_records() {
        let mut decoder = SseDecoder::new();
        let mut events = decoder.feed(b"data: {\"type\":\"text\",");
        assert!(events.is_empty());
        events.extend(decoder.feed(b"\"text\":\"ab\"}\ndata: {\"type\":\"done\"}\n"));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Text { text: "ab".into() });
    }

    #[test]
    fn skips_malformed_and_unknown_records() {
        let (events, _) = decode_all(
            "data: {not json\n\
             data: {\"type\":\"mystery\",\"x\":1}\n\
             : comment line\n\
             data: {\"type\":\"done\"}\n",
        );
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[test]
    fn nothing_after_terminal() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(
            b"data: {\"type\":\"done\"}\ndata: {\"type\":\"text\",\"text\":\"late\"}\n",
        );
        assert_eq!(events, vec![StreamEvent::Done]);
        assert!(decoder.is_finished());
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn eof_without_terminal_is_an_error() {
        let mut decoder = SseDecoder::new();
        decoder.feed(b"data: {\"type\":\"text\",\"text\":\"hi\"}\n");
        assert_eq!(
            decoder.finish(),
            Some(StreamEvent::Error {
                message: "unexpected EOF".into()
            })
        );
    }

    #[test]
    fn decode_is_right_inverse_of_encode() {
        let events = vec![
            StreamEvent::Text { text: "thinking".into() },
            StreamEvent::Tool {
                name: "bash".into(),
                id: Some("tu_1".into()),
                input: None,
            },
            StreamEvent::ToolsPending {
                content: vec![
                    ContentBlock::text("running it"),
                    ContentBlock::ToolUse {
                        id: "tu_1".into(),
                        name: "bash".into(),
                        input: json!({"command": "ls"}),
                    },
                ],
                tools: vec![ToolRequest {
                    id: "tu_1".into(),
                    name: "bash".into(),
                    input: json!({"command": "ls"}),
                }],
                iteration: Some(1),
                total_tool_calls: None,
            },
            StreamEvent::ToolResult {
                tool_use_id: "tu_0".into(),
                content: json!({"rows": 3}),
                is_error: Some(false),
            },
            StreamEvent::Usage {
                input_tokens: 120,
                output_tokens: 48,
            },
            StreamEvent::Done,
        ];

        let framed: String = events.iter().map(encode).collect();
        let mut decoder = SseDecoder::new();
        let decoded = decoder.feed(framed.as_bytes());
        assert_eq!(decoded, events);
        assert!(decoder.finish().is_none());
    }
}
