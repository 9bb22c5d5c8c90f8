//! Ask-user protocol tool.
//!
//! Suspends on the [`Interaction`](crate::tools::interact::Interaction)
//! callback; an interactive UI shows the prompt, a non-interactive session
//! answers deterministically without hanging.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::registry::{parse_params, Tool, ToolContext, ToolOutput};

pub struct AskUserTool;

#[derive(Deserialize)]
struct Params {
    question: String,
    #[serde(default)]
    options: Vec<String>,
}

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the user a clarifying question, optionally with choices. Use only \
         when you cannot proceed without their input."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to display"
                },
                "options": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Optional choices (2-4 is ideal)"
                }
            },
            "required": ["question"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutput {
        let params = match parse_params::<Params>(input) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let answer = ctx.interaction.ask(&params.question, &params.options).await;
        ToolOutput::success(answer)
    }
}
