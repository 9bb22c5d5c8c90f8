//! Core library for Wilson, a terminal assistant that drives a language
//! model through tool-augmented reasoning turns.
//!
//! The crate has three load-bearing subsystems:
//!
//! - [`agent`] — the loop controller: stream, execute, append, repeat, with
//!   duplicate blocking, history compaction, soft hints, and a hard
//!   iteration cap.
//! - [`tools`] — the tool runtime: registry, schema validation, permission
//!   policy with a dangerous-command screen, hook scripts, and the shell
//!   tool's foreground/background execution policy.
//! - [`swarm`] — the multi-process orchestrator: file queues, an advisory
//!   lock with stale-owner reclaim, workers, and a validator.
//!
//! [`ai`] holds the message types and SSE stream decoder; [`process`] the
//! pid-keyed background process registry; [`config`] the TOML configuration.

pub mod agent;
pub mod ai;
pub mod config;
pub mod process;
pub mod swarm;
pub mod tools;

pub use agent::{AgentLoop, LoopConfig, LoopEvent, LoopServices, SendHandle};
pub use ai::{Backend, ChatMessage, ContentBlock, Conversation, HttpBackend, Role, StreamEvent};
pub use config::WilsonConfig;
pub use process::ProcessRegistry;
pub use swarm::{SwarmOrchestrator, SwarmState, SwarmStore, Validator, Worker};
pub use tools::{
    Interaction, NonInteractive, Tool, ToolContext, ToolDispatcher, ToolOutput, ToolRegistry,
};
