//! Wilson CLI entry point.
//!
//! `wilson chat` runs the headless chat loop; `wilson swarm run` launches a
//! swarm, and `wilson swarm worker` / `wilson swarm validator` are the role
//! subcommands the orchestrator re-invokes as separate processes.

mod chat;
mod swarm_cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "wilson", version, about = "Terminal assistant with an agentic tool loop")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive (or one-shot) chat session.
    Chat {
        /// Send a single prompt and exit.
        #[arg(long)]
        prompt: Option<String>,
        /// Approve every permission request without prompting.
        #[arg(long)]
        auto_approve: bool,
        /// Working directory for tools (defaults to the current dir).
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Multi-process swarm on a shared goal.
    Swarm {
        #[command(subcommand)]
        role: SwarmRole,
    },
}

#[derive(Subcommand)]
enum SwarmRole {
    /// Decompose a goal, launch workers and a validator, wait for the swarm.
    Run {
        #[arg(long)]
        goal: String,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        swarm_dir: Option<String>,
    },

    /// Worker role (spawned by `swarm run`).
    Worker {
        #[arg(long)]
        id: String,
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        swarm_dir: String,
    },

    /// Validator role (spawned by `swarm run`).
    Validator {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        swarm_dir: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wilson=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        None => chat::run(None, false, None).await,
        Some(Command::Chat {
            prompt,
            auto_approve,
            dir,
        }) => chat::run(prompt, auto_approve, dir).await,
        Some(Command::Swarm { role }) => match role {
            SwarmRole::Run {
                goal,
                workers,
                dir,
                swarm_dir,
            } => swarm_cmd::run(goal, workers, dir, swarm_dir).await,
            SwarmRole::Worker { id, dir, swarm_dir } => {
                swarm_cmd::worker(id, dir, swarm_dir).await
            }
            SwarmRole::Validator { dir, swarm_dir } => swarm_cmd::validator(dir, swarm_dir).await,
        },
    }
}
