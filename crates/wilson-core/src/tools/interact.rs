//! User-interaction seam.
//!
//! The core never renders prompts. It calls through this trait and a UI
//! implements it; the non-interactive implementation answers deterministically
//! without blocking so headless runs and swarm workers never hang.

use async_trait::async_trait;

/// Callbacks the core may suspend on. Both may take arbitrarily long in an
/// interactive session.
#[async_trait]
pub trait Interaction: Send + Sync {
    /// Free-form question, optionally with choices. Returns the user's answer.
    async fn ask(&self, question: &str, options: &[String]) -> String;

    /// Permission request for a gated operation. Returns true to proceed.
    async fn request(&self, tool: &str, operation: &str, detail: &str) -> bool;
}

/// Fixed-answer implementation for headless environments.
#[derive(Debug, Clone)]
pub struct NonInteractive {
    approve: bool,
}

impl NonInteractive {
    /// Denies every permission request.
    pub fn deny_all() -> Self {
        Self { approve: false }
    }

    /// Approves every permission request (swarm workers run this way).
    pub fn approve_all() -> Self {
        Self { approve: true }
    }
}

#[async_trait]
impl Interaction for NonInteractive {
    async fn ask(&self, question: &str, _options: &[String]) -> String {
        tracing::debug!(question, "ask in non-interactive session");
        "No answer provided (non-interactive session)".to_string()
    }

    async fn request(&self, tool: &str, operation: &str, _detail: &str) -> bool {
        tracing::info!(tool, operation, approve = self.approve, "non-interactive permission request");
        self.approve
    }
}
