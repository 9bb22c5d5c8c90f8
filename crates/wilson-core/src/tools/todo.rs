//! Todo protocol tool.
//!
//! The model maintains a shared todo list through this tool; the UI layer
//! renders the same state. The tool replaces the whole list each call, which
//! keeps the protocol stateless from the model's point of view.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tools::registry::{parse_params, Tool, ToolContext, ToolOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
}

/// Shared todo state, owned by the session and handed to tools via context.
#[derive(Default)]
pub struct TodoList {
    items: parking_lot::Mutex<Vec<TodoItem>>,
}

impl TodoList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, items: Vec<TodoItem>) {
        *self.items.lock() = items;
    }

    pub fn items(&self) -> Vec<TodoItem> {
        self.items.lock().clone()
    }

    pub fn summary(&self) -> String {
        let items = self.items.lock();
        let completed = items
            .iter()
            .filter(|i| i.status == TodoStatus::Completed)
            .count();
        format!("{} of {} todos completed", completed, items.len())
    }
}

pub struct TodoTool;

#[derive(Deserialize)]
struct Params {
    todos: Vec<TodoItem>,
}

#[async_trait]
impl Tool for TodoTool {
    fn name(&self) -> &str {
        "todo"
    }

    fn description(&self) -> &str {
        "Replace the shared todo list. Send the full list each time; items have \
         a content string and a status of pending, in_progress, or completed."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "content": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"]
                            }
                        },
                        "required": ["content", "status"]
                    }
                }
            },
            "required": ["todos"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutput {
        let params = match parse_params::<Params>(input) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let Some(todos) = &ctx.todos else {
            return ToolOutput::failure("todo state unavailable in this context");
        };

        let count = params.todos.len();
        todos.replace(params.todos);
        ToolOutput::success(format!("Todo list updated ({} items); {}", count, todos.summary()))
    }
}
