//! Event protocol between the loop controller and its consumers.
//!
//! The controller emits a [`LoopEvent`] for every state change; presentation
//! layers (CLI printer, future TUI) map them to their own format. Inputs
//! flow the other way through the [`Interaction`](crate::tools::interact)
//! callbacks and the send's cancellation token.

use serde::Serialize;

/// Events emitted by the agent loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// Assistant text chunk.
    TextDelta { delta: String },

    /// Partial tool announcement from the stream (UI progress only).
    ToolAnnounced {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// A tool call is being executed.
    ToolExecuting { id: String, name: String },

    /// Live output from a running tool.
    ToolOutputDelta { id: String, delta: String },

    /// A tool call finished (client- or server-executed).
    ToolResult {
        id: String,
        output: String,
        is_error: bool,
    },

    /// A duplicate call was blocked instead of executed.
    ToolBlocked { id: String, name: String },

    /// Running token counters from the backend.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },

    /// A guidance or reflection prompt was injected into history.
    HintInjected { depth: usize },

    /// History was compacted before this iteration.
    Compacted {
        tokens_before: usize,
        tokens_after: usize,
    },

    /// One iteration finished.
    TurnComplete { depth: usize, has_more: bool },

    /// The hard iteration cap fired.
    LimitReached { depth: usize },

    /// The send resolved.
    Finished,

    /// Surfaced failure; the loop stops cleanly after this.
    Error { message: String },
}
