//! Processes protocol tool: the model's window into the background process
//! registry.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::registry::{parse_params, Tool, ToolContext, ToolOutput};

pub struct ProcessesTool;

#[derive(Deserialize)]
#[serde(rename_all = "lowercase", tag = "action")]
enum Params {
    List,
    Tail { pid: u32 },
    Kill { pid: u32 },
}

#[async_trait]
impl Tool for ProcessesTool {
    fn name(&self) -> &str {
        "processes"
    }

    fn description(&self) -> &str {
        "Inspect and manage background processes: list them, read the tail of \
         their output, or kill one by pid."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["list", "tail", "kill"]
                },
                "pid": {
                    "type": "integer",
                    "description": "Target pid (tail and kill)"
                }
            },
            "required": ["action"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolOutput {
        let params = match parse_params::<Params>(input) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let Some(registry) = &ctx.process_registry else {
            return ToolOutput::failure("process registry unavailable in this context");
        };

        match params {
            Params::List => {
                let infos = registry.list().await;
                if infos.is_empty() {
                    return ToolOutput::success("No background processes");
                }
                let lines: Vec<String> = infos
                    .iter()
                    .map(|i| format!("{}  {:?}  {}", i.pid, i.status, i.command))
                    .collect();
                ToolOutput::success(lines.join("\n"))
            }
            Params::Tail { pid } => match registry.tail(pid).await {
                Some(tail) => ToolOutput::success(tail),
                None => ToolOutput::failure(format!("no tracked process with pid {}", pid)),
            },
            Params::Kill { pid } => match registry.kill(pid).await {
                Ok(()) => ToolOutput::success(format!("Killed process {}", pid)),
                Err(e) => ToolOutput::failure(e.to_string()),
            },
        }
    }
}
