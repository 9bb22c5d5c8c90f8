//! Tool registry and execution primitives.
//!
//! Every tool result normalizes to a JSON object with a boolean `success`
//! and either a `content` string or an `error` string, plus free-form extras
//! (`_terminal`, `pid`, ...) that the loop controller inspects.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::process::ProcessRegistry;
use crate::tools::interact::{Interaction, NonInteractive};
use crate::tools::todo::TodoList;

/// Normalized result of one tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub content: Option<String>,
    pub error: Option<String>,
    /// Extra keys merged into the serialized object. `_terminal` and `pid`
    /// are the ones the core cares about.
    pub extras: Map<String, Value>,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: Some(content.into()),
            error: None,
            extras: Map::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: None,
            error: Some(error.into()),
            extras: Map::new(),
        }
    }

    /// Failure carrying the cancelled marker (permission denied, user said no).
    pub fn cancelled(error: impl Into<String>) -> Self {
        Self::failure(error).with_extra("cancelled", Value::Bool(true))
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    /// A truthy `_terminal` extra halts the agent loop.
    pub fn is_terminal(&self) -> bool {
        self.extras
            .get("_terminal")
            .map(|v| v.as_bool().unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn pid(&self) -> Option<u32> {
        self.extras.get("pid").and_then(|v| v.as_u64()).map(|p| p as u32)
    }

    /// Text shown for this result: content on success, error otherwise.
    pub fn summary(&self) -> &str {
        if self.success {
            self.content.as_deref().unwrap_or("")
        } else {
            self.error.as_deref().unwrap_or("tool failed")
        }
    }

    /// The JSON object fed back to the model as tool_result content.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("success".to_string(), Value::Bool(self.success));
        if let Some(content) = &self.content {
            obj.insert("content".to_string(), Value::String(content.clone()));
        }
        if let Some(error) = &self.error {
            obj.insert("error".to_string(), Value::String(error.clone()));
        }
        for (key, value) in &self.extras {
            obj.insert(key.clone(), value.clone());
        }
        Value::Object(obj)
    }
}

/// Parse tool input into a typed struct, normalizing failures.
pub fn parse_params<T: serde::de::DeserializeOwned>(input: Value) -> Result<T, ToolOutput> {
    serde_json::from_value(input)
        .map_err(|e| ToolOutput::failure(format!("Invalid parameters: {}", e)))
}

/// Output chunk from a streaming tool (bash).
#[derive(Debug, Clone)]
pub struct ToolOutputChunk {
    pub tool_use_id: String,
    pub chunk: String,
    pub is_complete: bool,
    pub exit_code: Option<i32>,
}

/// Context handed to each tool execution.
#[derive(Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    pub process_registry: Option<Arc<ProcessRegistry>>,
    pub todos: Option<Arc<TodoList>>,
    pub interaction: Arc<dyn Interaction>,
    /// Per-call timeout override for foreground shell commands.
    pub timeout: Option<Duration>,
    /// Channel for live tool output (paired with `tool_use_id`).
    pub output_tx: Option<mpsc::UnboundedSender<ToolOutputChunk>>,
    pub tool_use_id: Option<String>,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            process_registry: None,
            todos: None,
            interaction: Arc::new(NonInteractive::deny_all()),
            timeout: None,
            output_tx: None,
            tool_use_id: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_process_registry(mut self, registry: Arc<ProcessRegistry>) -> Self {
        self.process_registry = Some(registry);
        self
    }

    pub fn with_todos(mut self, todos: Arc<TodoList>) -> Self {
        self.todos = Some(todos);
        self
    }

    pub fn with_interaction(mut self, interaction: Arc<dyn Interaction>) -> Self {
        self.interaction = interaction;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_output_stream(
        mut self,
        tx: mpsc::UnboundedSender<ToolOutputChunk>,
        tool_use_id: String,
    ) -> Self {
        self.output_tx = Some(tx);
        self.tool_use_id = Some(tool_use_id);
        self
    }
}

/// Trait for tool implementations.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-schema-like object describing the input.
    fn schema(&self) -> Value;

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutput;
}

/// Name-keyed tool registry. Names are matched case-insensitively; unknown
/// names are a validation error upstream, never a crash.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_lowercase();
        self.tools.write().await.insert(name, tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(&name.to_lowercase()).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions in the shape the backend expects.
    pub async fn definitions(&self) -> Vec<Value> {
        self.tools
            .read()
            .await
            .values()
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "input_schema": t.schema(),
                })
            })
            .collect()
    }
}

/// Validate an input object against a declared schema: object kind, required
/// keys, and primitive property types. Deliberately shallow; tools do their
/// own fine-grained parsing via [`parse_params`].
pub fn validate_input(schema: &Value, input: &Value) -> Result<(), String> {
    if schema.get("type").and_then(|t| t.as_str()) == Some("object") {
        let Some(obj) = input.as_object() else {
            return Err("input must be a JSON object".to_string());
        };

        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for key in required.iter().filter_map(|k| k.as_str()) {
                if !obj.contains_key(key) {
                    return Err(format!("missing required field `{}`", key));
                }
            }
        }

        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (key, prop) in props {
                let Some(value) = obj.get(key) else { continue };
                let Some(expected) = prop.get("type").and_then(|t| t.as_str()) else {
                    continue;
                };
                if !type_matches(expected, value) {
                    return Err(format!("field `{}` must be of type {}", key, expected));
                }
            }
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}
