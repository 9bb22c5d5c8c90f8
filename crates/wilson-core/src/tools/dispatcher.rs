//! Tool dispatcher: validation, permission gating, hooks, and execution.
//!
//! Calls within one batch run sequentially so permission prompts and shared
//! todo state see a deterministic order. Every outcome, including panics
//! inside a tool, normalizes to a [`ToolOutput`].

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::agent::hooks::{HookDecision, HookRunner};
use crate::ai::types::ToolRequest;
use crate::tools::permissions::{dangerous_command, AuditLog, PermissionPolicy, PermissionRule};
use crate::tools::registry::{validate_input, ToolContext, ToolOutput, ToolRegistry};

/// One finished call from a batch.
#[derive(Debug, Clone)]
pub struct ExecutedCall {
    pub request: ToolRequest,
    pub output: ToolOutput,
    pub elapsed_ms: u64,
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    policy: PermissionPolicy,
    hooks: HookRunner,
    audit: AuditLog,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        policy: PermissionPolicy,
        hooks: HookRunner,
        audit: AuditLog,
    ) -> Self {
        Self {
            registry,
            policy,
            hooks,
            audit,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute a whole batch in order.
    pub async fn run_batch(&self, requests: &[ToolRequest], ctx: &ToolContext) -> Vec<ExecutedCall> {
        let mut executed = Vec::with_capacity(requests.len());
        for request in requests {
            executed.push(self.execute(request, ctx).await);
        }
        executed
    }

    /// Execute one call: validate, gate, hook, dispatch, normalize.
    pub async fn execute(&self, request: &ToolRequest, ctx: &ToolContext) -> ExecutedCall {
        let start = Instant::now();
        let output = self.execute_inner(request, ctx).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            tool = %request.name,
            success = output.success,
            elapsed_ms,
            "tool call finished"
        );

        ExecutedCall {
            request: request.clone(),
            output,
            elapsed_ms,
        }
    }

    async fn execute_inner(&self, request: &ToolRequest, ctx: &ToolContext) -> ToolOutput {
        // Validation: unknown names and schema mismatches fail fast.
        let Some(tool) = self.registry.get(&request.name).await else {
            return ToolOutput::failure(format!("Unknown tool: {}", request.name));
        };
        if let Err(e) = validate_input(&tool.schema(), &request.input) {
            return ToolOutput::failure(format!("Invalid input for {}: {}", request.name, e));
        }

        // Permission gate. Dangerous shell commands require the ask gate no
        // matter what the name policy says.
        let rule = self.policy.classify(&request.name);
        if rule == PermissionRule::Deny {
            return ToolOutput::failure(format!(
                "Permission denied: tool '{}' is blocked by policy",
                request.name
            ));
        }

        let shell_command = shell_command_of(request);
        let danger = shell_command.and_then(dangerous_command);
        let must_ask = rule == PermissionRule::Ask || danger.is_some();

        if must_ask {
            let detail = shell_command
                .map(ToString::to_string)
                .unwrap_or_else(|| compact_input(&request.input));
            let operation = danger.unwrap_or("execute");
            let approved = ctx
                .interaction
                .request(&request.name, operation, &detail)
                .await;

            if let (Some(command), Some(pattern)) = (shell_command, danger) {
                self.audit.record(command, pattern, approved);
            }

            if !approved {
                return ToolOutput::cancelled(format!(
                    "Tool '{}' was not approved by the user",
                    request.name
                ));
            }
        }

        // Pre-hooks can block.
        if let HookDecision::Block { reason } = self.hooks.run_pre(&request.name, &request.input).await
        {
            return ToolOutput::failure(format!("Blocked by hook: {}", reason));
        }

        // Dispatch on a separate task so a panicking tool normalizes into an
        // error result instead of tearing down the loop.
        let input = request.input.clone();
        let call_ctx = ctx.clone();
        let output = match tokio::spawn(async move { tool.execute(input, &call_ctx).await }).await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(tool = %request.name, "tool task failed: {}", e);
                ToolOutput::failure(format!("tool '{}' crashed: {}", request.name, e))
            }
        };

        self.hooks
            .run_post(&request.name, &request.input, &output.to_value())
            .await;

        output
    }
}

fn shell_command_of(request: &ToolRequest) -> Option<&str> {
    if !matches!(request.name.to_lowercase().as_str(), "bash" | "shell") {
        return None;
    }
    request.input.get("command").and_then(Value::as_str)
}

fn compact_input(input: &Value) -> String {
    let text = input.to_string();
    if text.len() <= 200 {
        return text;
    }
    let mut cut = 200;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::hooks::{HookKind, UserHook};
    use crate::tools::interact::{Interaction, NonInteractive};
    use crate::tools::registry::Tool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(&self, input: Value, _ctx: &ToolContext) -> ToolOutput {
            ToolOutput::success(input["text"].as_str().unwrap_or_default())
        }
    }

    struct PanickyTool;

    #[async_trait]
    impl Tool for PanickyTool {
        fn name(&self) -> &str {
            "panicky"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _input: Value, _ctx: &ToolContext) -> ToolOutput {
            panic!("boom");
        }
    }

    struct CountingGate {
        asked: AtomicUsize,
        approve: bool,
    }

    #[async_trait]
    impl Interaction for CountingGate {
        async fn ask(&self, _q: &str, _o: &[String]) -> String {
            String::new()
        }
        async fn request(&self, _tool: &str, _op: &str, _detail: &str) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.approve
        }
    }

    async fn dispatcher_with(policy: PermissionPolicy, hooks: Vec<UserHook>) -> ToolDispatcher {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(EchoTool)).await;
        registry.register(Arc::new(PanickyTool)).await;
        registry
            .register(Arc::new(crate::tools::shell::ShellTool))
            .await;
        let dir = tempfile::tempdir().unwrap();
        ToolDispatcher::new(
            registry,
            policy,
            HookRunner::new(hooks),
            AuditLog::new(dir.path().join("audit.jsonl")),
        )
    }

    fn request(name: &str, input: Value) -> ToolRequest {
        ToolRequest {
            id: "tu_1".into(),
            name: name.into(),
            input,
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_validation_error() {
        let d = dispatcher_with(PermissionPolicy::allow_all(), vec![]).await;
        let ctx = ToolContext::new(PathBuf::from("."));
        let call = d.execute(&request("mystery", json!({})), &ctx).await;
        assert!(!call.output.success);
        assert!(call.output.summary().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn schema_mismatch_is_rejected() {
        let d = dispatcher_with(PermissionPolicy::allow_all(), vec![]).await;
        let ctx = ToolContext::new(PathBuf::from("."));
        let call = d.execute(&request("echo", json!({"text": 42})), &ctx).await;
        assert!(!call.output.success);
        assert!(call.output.summary().contains("Invalid input"));
    }

    #[tokio::test]
    async fn deny_rule_fails_immediately() {
        let policy = PermissionPolicy::new(
            &[("echo".to_string(), PermissionRule::Deny)],
            PermissionRule::Allow,
        )
        .unwrap();
        let d = dispatcher_with(policy, vec![]).await;
        let ctx = ToolContext::new(PathBuf::from("."));
        let call = d.execute(&request("echo", json!({"text": "x"})), &ctx).await;
        assert!(!call.output.success);
        assert!(call.output.summary().contains("Permission denied"));
    }

    #[tokio::test]
    async fn ask_rule_consults_the_gate() {
        let policy = PermissionPolicy::new(
            &[("echo".to_string(), PermissionRule::Ask)],
            PermissionRule::Allow,
        )
        .unwrap();
        let d = dispatcher_with(policy, vec![]).await;
        let gate = Arc::new(CountingGate {
            asked: AtomicUsize::new(0),
            approve: false,
        });
        let ctx = ToolContext::new(PathBuf::from(".")).with_interaction(gate.clone());

        let call = d.execute(&request("echo", json!({"text": "x"})), &ctx).await;
        assert_eq!(gate.asked.load(Ordering::SeqCst), 1);
        assert!(!call.output.success);
        assert_eq!(call.output.extras["cancelled"], true);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dangerous_command_forces_ask_even_when_allowed() {
        let d = dispatcher_with(PermissionPolicy::allow_all(), vec![]).await;
        let gate = Arc::new(CountingGate {
            asked: AtomicUsize::new(0),
            approve: false,
        });
        let ctx = ToolContext::new(PathBuf::from(".")).with_interaction(gate.clone());

        let call = d
            .execute(&request("bash", json!({"command": "rm -rf target"})), &ctx)
            .await;
        assert_eq!(gate.asked.load(Ordering::SeqCst), 1);
        assert!(!call.output.success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn blocking_hook_fails_the_call() {
        let hooks = vec![UserHook {
            kind: HookKind::PreTool,
            tool_pattern: "echo".to_string(),
            command: "echo vetoed >&2; exit 2".to_string(),
        }];
        let d = dispatcher_with(PermissionPolicy::allow_all(), hooks).await;
        let ctx = ToolContext::new(PathBuf::from("."));
        let call = d.execute(&request("echo", json!({"text": "x"})), &ctx).await;
        assert!(!call.output.success);
        assert!(call.output.summary().contains("vetoed"));
    }

    #[tokio::test]
    async fn panics_normalize_to_errors() {
        let d = dispatcher_with(PermissionPolicy::allow_all(), vec![]).await;
        let ctx = ToolContext::new(PathBuf::from("."));
        let call = d.execute(&request("panicky", json!({})), &ctx).await;
        assert!(!call.output.success);
        assert!(call.output.summary().contains("crashed"));
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let d = dispatcher_with(PermissionPolicy::allow_all(), vec![]).await;
        let ctx = ToolContext::new(PathBuf::from("."));
        let requests = vec![
            request("echo", json!({"text": "first"})),
            request("echo", json!({"text": "second"})),
        ];
        let calls = d.run_batch(&requests, &ctx).await;
        assert_eq!(calls[0].output.summary(), "first");
        assert_eq!(calls[1].output.summary(), "second");
    }

    #[tokio::test]
    async fn approve_all_interaction_passes_the_gate() {
        let policy = PermissionPolicy::new(
            &[(".*".to_string(), PermissionRule::Ask)],
            PermissionRule::Ask,
        )
        .unwrap();
        let d = dispatcher_with(policy, vec![]).await;
        let ctx = ToolContext::new(PathBuf::from("."))
            .with_interaction(Arc::new(NonInteractive::approve_all()));
        let call = d.execute(&request("echo", json!({"text": "go"})), &ctx).await;
        assert!(call.output.success);
    }
}
