//! Headless chat runner: a line-oriented presentation layer over the agent
//! loop. Reads prompts from stdin, prints event text to stdout, diagnostics
//! to stderr.

use anyhow::Result;
use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use wilson_core::agent::hooks::HookRunner;
use wilson_core::agent::{AgentLoop, LoopEvent, LoopServices};
use wilson_core::ai::types::Conversation;
use wilson_core::ai::HttpBackend;
use wilson_core::tools::ask_user::AskUserTool;
use wilson_core::tools::permissions::AuditLog;
use wilson_core::tools::processes::ProcessesTool;
use wilson_core::tools::shell::ShellTool;
use wilson_core::tools::todo::TodoList;
use wilson_core::tools::{Interaction, NonInteractive, ToolDispatcher, ToolRegistry};
use wilson_core::{ProcessRegistry, WilsonConfig};

/// Terminal-prompt implementation of the interaction seam. Only consulted
/// between stdin reads of the outer loop, so the two never fight over input.
struct TerminalInteraction;

#[async_trait]
impl Interaction for TerminalInteraction {
    async fn ask(&self, question: &str, options: &[String]) -> String {
        println!("\n? {}", question);
        for (index, option) in options.iter().enumerate() {
            println!("  {}. {}", index + 1, option);
        }
        read_stdin_line().await.unwrap_or_default()
    }

    async fn request(&self, tool: &str, operation: &str, detail: &str) -> bool {
        println!("\n! {} wants to {}: {} [y/N]", tool, operation, detail);
        matches!(
            read_stdin_line().await.as_deref().map(str::trim),
            Some("y") | Some("Y") | Some("yes")
        )
    }
}

async fn read_stdin_line() -> Option<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).ok()?;
        if line.is_empty() {
            None
        } else {
            Some(line.trim_end().to_string())
        }
    })
    .await
    .ok()
    .flatten()
}

pub(crate) async fn build_services(
    config: &WilsonConfig,
    interaction: Arc<dyn Interaction>,
) -> Result<LoopServices> {
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(ShellTool)).await;
    registry.register(Arc::new(AskUserTool)).await;
    registry.register(Arc::new(ProcessesTool)).await;
    registry
        .register(Arc::new(wilson_core::tools::todo::TodoTool))
        .await;

    let dispatcher = ToolDispatcher::new(
        Arc::clone(&registry),
        config.permission_policy()?,
        HookRunner::new(config.hooks.clone()),
        AuditLog::new(AuditLog::default_path()),
    );

    let backend = HttpBackend::new(&config.backend_url, &config.model, config.api_key());

    Ok(LoopServices {
        backend: Arc::new(backend),
        dispatcher: Arc::new(dispatcher),
        process_registry: Arc::new(ProcessRegistry::new()),
        todos: Arc::new(TodoList::new()),
        interaction,
    })
}

pub(crate) async fn run(
    prompt: Option<String>,
    auto_approve: bool,
    dir: Option<PathBuf>,
) -> Result<()> {
    let working_dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let config = WilsonConfig::load(&working_dir)?;

    let interaction: Arc<dyn Interaction> = if auto_approve {
        Arc::new(NonInteractive::approve_all())
    } else {
        Arc::new(TerminalInteraction)
    };

    let services = build_services(&config, interaction).await?;
    let agent = AgentLoop::new(services.clone(), config.loop_config(working_dir));

    let mut conversation = Conversation::new();

    if let Some(prompt) = prompt {
        conversation = run_send(&agent, conversation, prompt).await?;
        services.process_registry.kill_all().await;
        return Ok(());
    }

    eprintln!("wilson ready; type a message (ctrl-d to quit)");
    loop {
        eprint!("> ");
        let Some(line) = read_stdin_line().await else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        conversation = run_send(&agent, conversation, line).await?;
    }

    services.process_registry.kill_all().await;
    Ok(())
}

/// Drive one send to completion, printing events. Ctrl-c cancels the send
/// (not the session); background children keep running.
async fn run_send(
    agent: &AgentLoop,
    conversation: Conversation,
    prompt: String,
) -> Result<Conversation> {
    let mut handle = agent.send(conversation, prompt);

    loop {
        tokio::select! {
            event = handle.events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n[cancelled]");
                handle.cancel.cancel();
            }
        }
    }

    let conversation = handle.done.await?;
    Ok(conversation)
}

fn print_event(event: &LoopEvent) {
    match event {
        LoopEvent::TextDelta { delta } => {
            print!("{}", delta);
            let _ = std::io::stdout().flush();
        }
        LoopEvent::ToolAnnounced { name, .. } => eprintln!("[tool] {} …", name),
        LoopEvent::ToolExecuting { name, .. } => eprintln!("[run ] {}", name),
        LoopEvent::ToolOutputDelta { delta, .. } => eprint!("{}", delta),
        LoopEvent::ToolResult { output, is_error, .. } => {
            let prefix = if *is_error { "fail" } else { " ok " };
            eprintln!("[{}] {}", prefix, first_line(output));
        }
        LoopEvent::ToolBlocked { name, .. } => eprintln!("[skip] duplicate {} call", name),
        LoopEvent::HintInjected { depth } => tracing::debug!(depth, "hint injected"),
        LoopEvent::Compacted {
            tokens_before,
            tokens_after,
        } => eprintln!("[compacted {} -> {} tokens]", tokens_before, tokens_after),
        LoopEvent::Usage { .. } | LoopEvent::TurnComplete { .. } => {}
        LoopEvent::LimitReached { depth } => eprintln!("[iteration limit at depth {}]", depth),
        LoopEvent::Error { message } => eprintln!("\n[error] {}", message),
        LoopEvent::Finished => println!(),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
