//! User-configurable hook scripts.
//!
//! Hooks are shell commands matched against tool names by regex and run
//! before or after tool execution. The hook receives a JSON payload on stdin
//! and speaks through its exit code:
//!
//! - 0: continue (stdout/stderr not shown)
//! - 2: block the tool; stderr becomes the reason shown to the model
//! - other: warn the user with stderr, but continue

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const HOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    PreTool,
    PostTool,
}

/// One configured hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserHook {
    pub kind: HookKind,
    /// Regex matched against the tool name.
    pub tool_pattern: String,
    pub command: String,
}

/// Outcome of running a hook (or a chain of them).
#[derive(Debug, Clone, PartialEq)]
pub enum HookDecision {
    Continue,
    Block { reason: String },
    Warn { message: String },
}

/// Compiled hook set. Invalid patterns are dropped at construction with a
/// warning rather than failing the session.
pub struct HookRunner {
    hooks: Vec<(UserHook, Regex)>,
}

impl HookRunner {
    pub fn new(hooks: Vec<UserHook>) -> Self {
        let mut compiled = Vec::with_capacity(hooks.len());
        for hook in hooks {
            match Regex::new(&hook.tool_pattern) {
                Ok(regex) => compiled.push((hook, regex)),
                Err(e) => {
                    tracing::warn!(pattern = %hook.tool_pattern, "dropping hook with invalid pattern: {}", e)
                }
            }
        }
        Self { hooks: compiled }
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run matching pre-tool hooks. The first block wins; warnings are
    /// logged and execution continues.
    pub async fn run_pre(&self, tool_name: &str, input: &serde_json::Value) -> HookDecision {
        self.run_matching(HookKind::PreTool, tool_name, input, None).await
    }

    /// Run matching post-tool hooks. Post hooks never block.
    pub async fn run_post(
        &self,
        tool_name: &str,
        input: &serde_json::Value,
        result: &serde_json::Value,
    ) {
        let _ = self
            .run_matching(HookKind::PostTool, tool_name, input, Some(result))
            .await;
    }

    async fn run_matching(
        &self,
        kind: HookKind,
        tool_name: &str,
        input: &serde_json::Value,
        result: Option<&serde_json::Value>,
    ) -> HookDecision {
        for (hook, regex) in &self.hooks {
            if hook.kind != kind || !regex.is_match(tool_name) {
                continue;
            }

            match execute_hook(hook, tool_name, input, result).await {
                HookDecision::Block { reason } => {
                    tracing::info!(tool = tool_name, command = %hook.command, "hook blocked execution: {}", reason);
                    if kind == HookKind::PreTool {
                        return HookDecision::Block { reason };
                    }
                }
                HookDecision::Warn { message } => {
                    tracing::warn!(tool = tool_name, command = %hook.command, "hook warning: {}", message);
                }
                HookDecision::Continue => {}
            }
        }
        HookDecision::Continue
    }
}

async fn execute_hook(
    hook: &UserHook,
    tool_name: &str,
    input: &serde_json::Value,
    result: Option<&serde_json::Value>,
) -> HookDecision {
    let mut payload = serde_json::json!({
        "tool_name": tool_name,
        "tool_input": input,
        "hook_kind": hook.kind,
    });
    if let Some(result) = result {
        payload["tool_result"] = result.clone();
    }

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(&hook.command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            return HookDecision::Warn {
                message: format!("hook failed to spawn: {}", e),
            }
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(payload.to_string().as_bytes()).await;
        // stdin drops closed here
    }

    let output = match tokio::time::timeout(HOOK_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return HookDecision::Warn {
                message: format!("hook execution failed: {}", e),
            }
        }
        Err(_) => {
            return HookDecision::Warn {
                message: "hook timed out after 30 seconds".to_string(),
            }
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    match exit_code {
        0 => HookDecision::Continue,
        2 => HookDecision::Block {
            reason: if stderr.is_empty() {
                "hook blocked execution".to_string()
            } else {
                stderr
            },
        },
        _ => HookDecision::Warn {
            message: if stderr.is_empty() {
                format!("hook exited with code {}", exit_code)
            } else {
                stderr
            },
        },
    }
}
