//! The agent loop controller.
//!
//! Drives the request → stream → execute → append cycle for one send until
//! the model stops asking for tools, a terminal tool ends the turn, or the
//! safety cap fires. Iterations are strictly sequential; within an iteration
//! tools run one at a time in the order the model produced them.
//!
//! ```text
//!          IDLE ──send──► STREAMING ──no tools──► FINALIZED
//!                             │
//!                       tools_pending
//!                             ▼
//!                         DEDUPING ──all blocked──► FINALIZED (graceful)
//!                             ▼
//!                        EXECUTING ──terminal tool──► FINALIZED (terminal)
//!                             ▼
//!                         APPENDED ──depth ≥ cap──► STOPPED (limit)
//!                             │
//!                             └──► STREAMING (next iteration)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ai::backend::{Backend, BackendError};
use crate::ai::types::{
    CacheControl, ChatMessage, ContentBlock, Conversation, Role, ToolCall, ToolCallStatus,
    ToolRequest,
};
use crate::process::ProcessRegistry;
use crate::tools::dispatcher::ToolDispatcher;
use crate::tools::interact::Interaction;
use crate::tools::registry::{ToolContext, ToolOutput, ToolOutputChunk};
use crate::tools::todo::TodoList;
use crate::tools::truncation::{cap_tail, tail_bytes};

use super::compactor::{CompactionConfig, Compactor};
use super::dedup::{LoopState, ToolSignature};
use super::loop_events::LoopEvent;
use super::stream;

/// Hard iteration cap. Deliberately low; the last line of defense, not the
/// primary correctness mechanism.
pub const MAX_ITERATIONS: usize = 15;

/// Depths that get a completion-guidance hint.
const GUIDANCE_DEPTHS: [usize; 2] = [5, 10];
/// Every this-many completed iterations, a reflection prompt lists recent
/// tool names.
const REFLECTION_EVERY: usize = 5;

const DEFAULT_HISTORY_WINDOW: usize = 40;

/// tool_use inputs above this size are elided from the assistant turn that
/// gets reflected back to the model (bulky Write bodies and the like).
const MAX_REFLECTED_INPUT_BYTES: usize = 2_000;

/// Model-bound cap for a single tool_result payload.
const MAX_RESULT_BYTES: usize = 30_000;

/// Cap on the per-call streamed-output buffer kept on the [`ToolCall`]
/// record (tail, like the process registry's).
const STREAMED_OUTPUT_CAP: usize = 10 * 1024;

const DUPLICATE_PREFIX: &str = "[TOOL COMPLETE - DO NOT CALL THIS TOOL AGAIN WITH SAME PARAMETERS]";

#[derive(Clone)]
pub struct LoopConfig {
    pub max_iterations: usize,
    /// How many prior messages of the session are carried into a send.
    pub history_window: usize,
    pub working_dir: PathBuf,
    pub compaction: CompactionConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: MAX_ITERATIONS,
            history_window: DEFAULT_HISTORY_WINDOW,
            working_dir: PathBuf::from("."),
            compaction: CompactionConfig::default(),
        }
    }
}

/// Shared services a send needs.
#[derive(Clone)]
pub struct LoopServices {
    pub backend: Arc<dyn Backend>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub process_registry: Arc<ProcessRegistry>,
    pub todos: Arc<TodoList>,
    pub interaction: Arc<dyn Interaction>,
}

/// Handle to an in-flight send. Cancelling propagates to the backend stream
/// and any foreground tool; background children keep running deliberately.
pub struct SendHandle {
    pub events: mpsc::UnboundedReceiver<LoopEvent>,
    pub cancel: CancellationToken,
    pub done: tokio::task::JoinHandle<Conversation>,
}

pub struct AgentLoop {
    services: LoopServices,
    config: LoopConfig,
}

impl AgentLoop {
    pub fn new(services: LoopServices, config: LoopConfig) -> Self {
        Self { services, config }
    }

    /// Start a send. The loop runs as a spawned task; the caller drains
    /// events and awaits `done` for the updated conversation. Starting a new
    /// send while one is in flight is the caller's cue to cancel the old
    /// handle first.
    pub fn send(&self, conversation: Conversation, user_text: impl Into<String>) -> SendHandle {
        let (event_tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let done = tokio::spawn(run_send(
            self.services.clone(),
            self.config.clone(),
            conversation,
            user_text.into(),
            event_tx,
            cancel.clone(),
        ));
        SendHandle {
            events,
            cancel,
            done,
        }
    }
}

async fn run_send(
    services: LoopServices,
    config: LoopConfig,
    mut conversation: Conversation,
    user_text: String,
    event_tx: mpsc::UnboundedSender<LoopEvent>,
    cancel: CancellationToken,
) -> Conversation {
    // Working history: the last K session messages plus the new user turn.
    let window_start = conversation
        .messages
        .len()
        .saturating_sub(config.history_window);
    let mut history = Conversation {
        messages: conversation.messages[window_start..].to_vec(),
        token_estimate: 0,
    };
    let carried = history.messages.len();
    history.push(ChatMessage::user_text(user_text));

    let compactor = Compactor::new(config.compaction.clone());
    let mut state = LoopState::new();

    loop {
        // Safety bound: state.depth counts completed iterations.
        if state.depth >= config.max_iterations {
            let note = format!(
                "Stopped: this request hit the {}-iteration safety limit before completing. \
                 The work so far is preserved; send a follow-up to continue.",
                config.max_iterations
            );
            let _ = event_tx.send(LoopEvent::LimitReached { depth: state.depth });
            let _ = event_tx.send(LoopEvent::Error {
                message: note.clone(),
            });
            let mut message = ChatMessage::assistant(vec![ContentBlock::text(note)]);
            message.tool_calls = state.tool_calls.clone();
            history.push(message);
            break;
        }

        // Soft guidance, injected as user-role turns so the model treats
        // them as observations rather than its own output.
        if state.depth > 0 {
            if GUIDANCE_DEPTHS.contains(&state.depth) {
                history.push(ChatMessage::user_text(format!(
                    "You are {} tool iterations into this request. Focus on finishing; \
                     only call more tools if strictly necessary.",
                    state.depth
                )));
                let _ = event_tx.send(LoopEvent::HintInjected { depth: state.depth });
            }
            if state.depth % REFLECTION_EVERY == 0 {
                history.push(ChatMessage::user_text(format!(
                    "Reflection: tools used so far: {}. If their results already answer \
                     the request, respond with the answer now.",
                    state.recent_summary()
                )));
                let _ = event_tx.send(LoopEvent::HintInjected { depth: state.depth });
            }
        }

        let report = compactor.compact(&mut history);
        if report.compacted {
            let _ = event_tx.send(LoopEvent::Compacted {
                tokens_before: report.tokens_before,
                tokens_after: report.tokens_after,
            });
        }

        let rx = match services.backend.stream_chat(&history.messages, &cancel).await {
            Ok(rx) => rx,
            Err(BackendError::Cancelled) => break,
            Err(e) => {
                let _ = event_tx.send(LoopEvent::Error {
                    message: format!("backend request failed: {}", e),
                });
                break;
            }
        };

        let outcome = stream::consume(rx, &event_tx).await;
        state.depth += 1;

        if cancel.is_cancelled() {
            tracing::info!(depth = state.depth, "send cancelled");
            break;
        }

        if let Some(message) = outcome.error {
            let _ = event_tx.send(LoopEvent::Error { message });
            break;
        }

        // No tools requested: the turn is terminal.
        if outcome.tools.is_empty() {
            let mut message = ChatMessage::assistant(outcome.content);
            message.tool_calls = state.tool_calls.clone();
            history.push(message);
            let _ = event_tx.send(LoopEvent::TurnComplete {
                depth: state.depth,
                has_more: false,
            });
            break;
        }

        // Dedup pass against the state as of batch start.
        let all_blocked = outcome.tools.iter().all(|request| {
            state
                .duplicate_of(&ToolSignature::of(&request.name, &request.input))
                .is_some()
        });
        if all_blocked {
            // Graceful finalize: substitute every result, keep a short
            // completion text, and stop without another model round-trip.
            let mut assistant = ChatMessage::assistant(elide_bulky_inputs(outcome.content));
            let mut blocked_results = Vec::with_capacity(outcome.tools.len());
            for request in &outcome.tools {
                tracing::warn!(tool = %request.name, id = %request.id, "duplicate tool call blocked");
                let _ = event_tx.send(LoopEvent::ToolBlocked {
                    id: request.id.clone(),
                    name: request.name.clone(),
                });
                let mut record = ToolCall::pending(request);
                record.status = ToolCallStatus::Completed;
                assistant.tool_calls.push(record);
                blocked_results.push(blocked_result_block(request));
            }
            history.push(assistant);
            history.push(ChatMessage::new(Role::User, blocked_results));

            let completion = if outcome.text.trim().is_empty() {
                "Every requested tool call had already run with identical parameters; \
                 nothing further to do."
                    .to_string()
            } else {
                outcome.text.clone()
            };
            let mut message = ChatMessage::assistant(vec![ContentBlock::text(completion)]);
            message.tool_calls = state.tool_calls.clone();
            history.push(message);
            let _ = event_tx.send(LoopEvent::TurnComplete {
                depth: state.depth,
                has_more: false,
            });
            break;
        }

        // Execute sequentially. Duplicates that show up mid-batch are
        // blocked here with the same substitute result.
        let mut batch_records: Vec<ToolCall> = Vec::new();
        let mut result_blocks: Vec<ContentBlock> = Vec::new();
        let mut terminal: Option<ToolOutput> = None;

        for request in &outcome.tools {
            let signature = ToolSignature::of(&request.name, &request.input);

            // A server-side result claims this id; first writer wins.
            if let Some((content, is_error)) = outcome.server_results.get(&request.id) {
                let mut record = ToolCall::pending(request);
                record.status = if *is_error {
                    ToolCallStatus::Error
                } else {
                    ToolCallStatus::Completed
                };
                record.result = Some(content.clone());
                state.record(signature, &request.name);
                state.tool_calls.push(record.clone());
                batch_records.push(record);
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: request.id.clone(),
                    content: content.clone(),
                    is_error: (*is_error).then_some(true),
                    cache_control: None,
                });
                continue;
            }

            if let Some(kind) = state.duplicate_of(&signature) {
                tracing::warn!(tool = %request.name, id = %request.id, ?kind, "duplicate tool call blocked");
                let _ = event_tx.send(LoopEvent::ToolBlocked {
                    id: request.id.clone(),
                    name: request.name.clone(),
                });
                let mut record = ToolCall::pending(request);
                record.status = ToolCallStatus::Completed;
                batch_records.push(record);
                result_blocks.push(blocked_result_block(request));
                continue;
            }

            let _ = event_tx.send(LoopEvent::ToolExecuting {
                id: request.id.clone(),
                name: request.name.clone(),
            });

            // Forward live tool output chunks as loop events, and buffer
            // them for the call record so history readers see the stream
            // after the fact.
            let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<ToolOutputChunk>();
            let forward_tx = event_tx.clone();
            let forwarder = tokio::spawn(async move {
                let mut buffered = String::new();
                while let Some(chunk) = chunk_rx.recv().await {
                    if !chunk.chunk.is_empty() {
                        buffered.push_str(&chunk.chunk);
                        if buffered.len() > STREAMED_OUTPUT_CAP {
                            buffered = tail_bytes(&buffered, STREAMED_OUTPUT_CAP).to_string();
                        }
                        let _ = forward_tx.send(LoopEvent::ToolOutputDelta {
                            id: chunk.tool_use_id.clone(),
                            delta: chunk.chunk,
                        });
                    }
                    if chunk.is_complete {
                        break;
                    }
                }
                buffered
            });

            let ctx = ToolContext::new(config.working_dir.clone())
                .with_process_registry(Arc::clone(&services.process_registry))
                .with_todos(Arc::clone(&services.todos))
                .with_interaction(Arc::clone(&services.interaction))
                .with_cancel(cancel.clone())
                .with_output_stream(chunk_tx, request.id.clone());

            let executed = services.dispatcher.execute(request, &ctx).await;
            drop(ctx);
            let streamed_output = forwarder.await.unwrap_or_default();

            let mut output = executed.output;
            if let Some(content) = &output.content {
                if content.len() > MAX_RESULT_BYTES {
                    output.content = Some(cap_tail(content, MAX_RESULT_BYTES));
                }
            }

            let _ = event_tx.send(LoopEvent::ToolResult {
                id: request.id.clone(),
                output: output.summary().to_string(),
                is_error: !output.success,
            });

            let mut record = ToolCall::pending(request);
            record.status = if output.success {
                ToolCallStatus::Completed
            } else if output.extras.get("cancelled").is_some() {
                ToolCallStatus::Cancelled
            } else {
                ToolCallStatus::Error
            };
            record.result = Some(output.to_value());
            record.elapsed_ms = Some(executed.elapsed_ms);
            record.output = streamed_output;
            state.record(signature, &request.name);
            state.tool_calls.push(record.clone());
            batch_records.push(record);

            if output.is_terminal() {
                terminal = Some(output);
                break;
            }

            result_blocks.push(ContentBlock::ToolResult {
                tool_use_id: request.id.clone(),
                content: output.to_value(),
                is_error: (!output.success).then_some(true),
                cache_control: output.success.then(CacheControl::ephemeral),
            });
        }

        // Terminal action: the tool's summary becomes the assistant message
        // and the loop ends regardless of any tools_pending residue.
        if let Some(output) = terminal {
            let mut message =
                ChatMessage::assistant(vec![ContentBlock::text(output.summary())]);
            message.tool_calls = state.tool_calls.clone();
            history.push(message);
            let _ = event_tx.send(LoopEvent::TurnComplete {
                depth: state.depth,
                has_more: false,
            });
            break;
        }

        // Reflect the assistant turn back (bulky inputs elided) followed by
        // the tool results as a user-role message.
        let mut assistant = ChatMessage::assistant(elide_bulky_inputs(outcome.content));
        assistant.tool_calls = batch_records;
        history.push(assistant);
        history.push(ChatMessage::new(Role::User, result_blocks));

        let _ = event_tx.send(LoopEvent::TurnComplete {
            depth: state.depth,
            has_more: true,
        });
    }

    let _ = event_tx.send(LoopEvent::Finished);

    // Graft everything this send produced back onto the session.
    conversation
        .messages
        .extend(history.messages.into_iter().skip(carried));
    conversation.reestimate();
    conversation
}

/// Substitute result for a blocked duplicate. The marker leads the payload
/// as plain text so the model cannot miss it.
fn blocked_result_block(request: &ToolRequest) -> ContentBlock {
    ContentBlock::ToolResult {
        tool_use_id: request.id.clone(),
        content: serde_json::Value::String(format!(
            "{} '{}' already ran with these exact parameters during this request; \
             reuse its previous result.",
            DUPLICATE_PREFIX, request.name
        )),
        is_error: None,
        cache_control: None,
    }
}

/// Replace oversized tool_use inputs before re-sending the assistant turn.
fn elide_bulky_inputs(blocks: Vec<ContentBlock>) -> Vec<ContentBlock> {
    blocks
        .into_iter()
        .map(|block| match block {
            ContentBlock::ToolUse { id, name, input }
                if input.to_string().len() > MAX_REFLECTED_INPUT_BYTES =>
            {
                let original_bytes = input.to_string().len();
                ContentBlock::ToolUse {
                    id,
                    name,
                    input: serde_json::json!({
                        "_elided": true,
                        "original_bytes": original_bytes,
                    }),
                }
            }
            other => other,
        })
        .collect()
}
