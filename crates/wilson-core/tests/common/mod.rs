//! Shared test harness: a scripted backend and service wiring for driving
//! the agent loop without a network.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use wilson_core::agent::hooks::HookRunner;
use wilson_core::agent::{AgentLoop, LoopConfig, LoopEvent, LoopServices};
use wilson_core::ai::backend::{Backend, BackendError};
use wilson_core::ai::sse::StreamEvent;
use wilson_core::ai::types::{ChatMessage, ContentBlock, Conversation, ToolRequest};
use wilson_core::tools::permissions::{AuditLog, PermissionPolicy};
use wilson_core::tools::todo::TodoList;
use wilson_core::tools::{
    NonInteractive, Tool, ToolContext, ToolDispatcher, ToolOutput, ToolRegistry,
};
use wilson_core::ProcessRegistry;

/// One scripted model turn.
pub enum ScriptedTurn {
    /// Emit these events, then close the stream.
    Events(Vec<StreamEvent>),
    /// Emit these events, then hold the stream open until cancellation.
    Hang(Vec<StreamEvent>),
}

/// Backend that replays scripted turns and records every request it sees.
pub struct ScriptedBackend {
    turns: parking_lot::Mutex<VecDeque<ScriptedTurn>>,
    calls: parking_lot::Mutex<Vec<Vec<ChatMessage>>>,
    endless_tools: bool,
    counter: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(turns: Vec<Vec<StreamEvent>>) -> Arc<Self> {
        Self::with_turns(turns.into_iter().map(ScriptedTurn::Events).collect())
    }

    pub fn with_turns(turns: Vec<ScriptedTurn>) -> Arc<Self> {
        Arc::new(Self {
            turns: parking_lot::Mutex::new(turns.into()),
            calls: parking_lot::Mutex::new(Vec::new()),
            endless_tools: false,
            counter: AtomicUsize::new(0),
        })
    }

    /// A backend that requests a fresh (never-duplicate) tool call on every
    /// turn, forever.
    pub fn endless_tools() -> Arc<Self> {
        Arc::new(Self {
            turns: parking_lot::Mutex::new(VecDeque::new()),
            calls: parking_lot::Mutex::new(Vec::new()),
            endless_tools: true,
            counter: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn remaining_turns(&self) -> usize {
        self.turns.lock().len()
    }

    pub fn request_messages(&self, call: usize) -> Vec<ChatMessage> {
        self.calls.lock()[call].clone()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<StreamEvent>, BackendError> {
        self.calls.lock().push(messages.to_vec());
        let turn = self.turns.lock().pop_front();
        let (tx, rx) = mpsc::unbounded_channel();

        match turn {
            Some(ScriptedTurn::Events(events)) => {
                for event in events {
                    let _ = tx.send(event);
                }
            }
            Some(ScriptedTurn::Hang(events)) => {
                for event in events {
                    let _ = tx.send(event);
                }
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    drop(tx); // closes without a terminal event, like a torn connection
                });
            }
            None if self.endless_tools => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst);
                let id = format!("tu_{}", n);
                let input = json!({ "text": format!("step {}", n) });
                let _ = tx.send(StreamEvent::ToolsPending {
                    content: vec![ContentBlock::ToolUse {
                        id: id.clone(),
                        name: "echo".to_string(),
                        input: input.clone(),
                    }],
                    tools: vec![ToolRequest {
                        id,
                        name: "echo".to_string(),
                        input,
                    }],
                    iteration: Some(n as u64),
                    total_tool_calls: None,
                });
                let _ = tx.send(StreamEvent::Done);
            }
            None => {
                let _ = tx.send(StreamEvent::Done);
            }
        }

        Ok(rx)
    }
}

/// Trivial echo tool used by most scenarios.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the text input back"
    }
    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    async fn execute(&self, input: serde_json::Value, _ctx: &ToolContext) -> ToolOutput {
        ToolOutput::success(input["text"].as_str().unwrap_or_default())
    }
}

/// File-reader stand-in returning fixed content.
pub struct StubReadTool {
    pub content: &'static str,
}

#[async_trait]
impl Tool for StubReadTool {
    fn name(&self) -> &str {
        "read"
    }
    fn description(&self) -> &str {
        "Read a file"
    }
    fn schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }
    async fn execute(&self, _input: serde_json::Value, _ctx: &ToolContext) -> ToolOutput {
        ToolOutput::success(self.content)
    }
}

pub async fn make_services(
    backend: Arc<dyn Backend>,
    tools: Vec<Arc<dyn Tool>>,
) -> LoopServices {
    let registry = Arc::new(ToolRegistry::new());
    for tool in tools {
        registry.register(tool).await;
    }
    registry
        .register(Arc::new(wilson_core::tools::shell::ShellTool))
        .await;

    let audit_path = std::env::temp_dir().join(format!(
        "wilson-test-audit-{}.jsonl",
        uuid::Uuid::new_v4()
    ));
    let dispatcher = ToolDispatcher::new(
        registry,
        PermissionPolicy::allow_all(),
        HookRunner::new(Vec::new()),
        AuditLog::new(audit_path),
    );

    LoopServices {
        backend,
        dispatcher: Arc::new(dispatcher),
        process_registry: Arc::new(ProcessRegistry::new()),
        todos: Arc::new(TodoList::new()),
        interaction: Arc::new(NonInteractive::approve_all()),
    }
}

pub fn loop_config() -> LoopConfig {
    LoopConfig {
        working_dir: std::env::temp_dir(),
        ..LoopConfig::default()
    }
}

/// Drive one send to completion, collecting every event.
pub async fn run_send(
    agent: &AgentLoop,
    conversation: Conversation,
    prompt: &str,
) -> (Vec<LoopEvent>, Conversation) {
    let mut handle = agent.send(conversation, prompt);
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        events.push(event);
    }
    let conversation = handle.done.await.expect("send task completed");
    (events, conversation)
}

/// Every tool_use block in message m must be answered by exactly one
/// tool_result in message m+1, and vice versa.
pub fn assert_pairing(conversation: &Conversation) {
    let messages = &conversation.messages;
    for (index, message) in messages.iter().enumerate() {
        let uses = message.tool_use_ids();
        if uses.is_empty() {
            continue;
        }
        let results = messages
            .get(index + 1)
            .map(|m| m.tool_result_ids())
            .unwrap_or_default();
        assert_eq!(
            uses, results,
            "tool_use blocks in message {} must pair with results in message {}",
            index,
            index + 1
        );
    }
    for (index, message) in messages.iter().enumerate() {
        let results = message.tool_result_ids();
        if results.is_empty() {
            continue;
        }
        assert!(index > 0, "tool_result message cannot be first");
        let uses = messages[index - 1].tool_use_ids();
        assert_eq!(uses, results);
    }
}
