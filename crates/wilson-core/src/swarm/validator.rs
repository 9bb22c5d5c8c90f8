//! Swarm validator: the gate between "a worker says it's done" and
//! "the swarm counts it as done".
//!
//! Pops from the completion queue, runs the check chain, and either promotes
//! the task to completed or requeues it (retryCount+1) until maxRetries.
//! A check that itself errors — build tool missing, command not found — is
//! treated as a pass-through, never a failure.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::store::{SwarmMessage, SwarmStore};
use super::task::{SwarmTask, TaskStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const CHECK_TIMEOUT: Duration = Duration::from_secs(300);

/// One link in the validation chain.
#[async_trait]
pub trait ValidationCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Ok(true)=pass, Ok(false)=fail. Err means the check could not run and
    /// counts as a pass.
    async fn check(&self, task: &SwarmTask, working_dir: &Path) -> Result<bool>;
}

/// The task's working directory must exist and be readable.
pub struct FilesPresentCheck;

#[async_trait]
impl ValidationCheck for FilesPresentCheck {
    fn name(&self) -> &str {
        "files_present"
    }

    async fn check(&self, task: &SwarmTask, working_dir: &Path) -> Result<bool> {
        let dir = task.working_dir.as_deref().unwrap_or(working_dir);
        Ok(std::fs::read_dir(dir).is_ok())
    }
}

/// Run a shell command when its marker file is present; absent marker means
/// not applicable (pass).
pub struct CommandCheck {
    name: &'static str,
    marker: &'static str,
    command: &'static str,
}

impl CommandCheck {
    pub fn build_rust() -> Self {
        Self {
            name: "build",
            marker: "Cargo.toml",
            command: "cargo check --quiet",
        }
    }

    pub fn test_rust() -> Self {
        Self {
            name: "tests",
            marker: "Cargo.toml",
            command: "cargo test --quiet",
        }
    }

    pub fn build_node() -> Self {
        Self {
            name: "build",
            marker: "package.json",
            command: "npm run build --if-present",
        }
    }
}

#[async_trait]
impl ValidationCheck for CommandCheck {
    fn name(&self) -> &str {
        self.name
    }

    async fn check(&self, task: &SwarmTask, working_dir: &Path) -> Result<bool> {
        let dir = task.working_dir.as_deref().unwrap_or(working_dir);
        if !dir.join(self.marker).exists() {
            return Ok(true);
        }

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(self.command).current_dir(dir);
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());

        let status = tokio::time::timeout(CHECK_TIMEOUT, cmd.status())
            .await
            .map_err(|_| anyhow::anyhow!("check '{}' timed out", self.name))??;
        Ok(status.success())
    }
}

pub struct Validator {
    store: SwarmStore,
    working_dir: PathBuf,
    checks: Vec<Arc<dyn ValidationCheck>>,
}

impl Validator {
    pub fn new(store: SwarmStore, working_dir: PathBuf) -> Self {
        Self {
            store,
            working_dir,
            checks: vec![
                Arc::new(FilesPresentCheck),
                Arc::new(CommandCheck::build_rust()),
                Arc::new(CommandCheck::build_node()),
                Arc::new(CommandCheck::test_rust()),
            ],
        }
    }

    pub fn with_checks(store: SwarmStore, working_dir: PathBuf, checks: Vec<Arc<dyn ValidationCheck>>) -> Self {
        Self {
            store,
            working_dir,
            checks,
        }
    }

    /// Run until the swarm reaches a terminal state.
    pub async fn run(&self) -> Result<()> {
        tracing::info!("validator started");

        loop {
            if let Some(state) = self.store.load_state()? {
                if state.is_terminal() {
                    break;
                }
            }

            let Some(task) = self.store.pop_completion().await? else {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            };

            let worker_says_ok = task.result.as_ref().map(|r| r.success).unwrap_or(false);
            let passed = worker_says_ok && self.validate(&task).await;

            if passed {
                self.complete(task).await?;
            } else {
                self.retry_or_fail(task).await?;
            }
        }

        tracing::info!("validator exiting");
        Ok(())
    }

    async fn validate(&self, task: &SwarmTask) -> bool {
        for check in &self.checks {
            match check.check(task, &self.working_dir).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(task = %task.id, check = check.name(), "validation failed");
                    return false;
                }
                Err(e) => {
                    // Pass-through: a check that cannot run never fails a task.
                    tracing::warn!(task = %task.id, check = check.name(), "check errored, passing through: {}", e);
                }
            }
        }
        true
    }

    async fn complete(&self, mut task: SwarmTask) -> Result<()> {
        task.status = TaskStatus::Completed;
        task.touch();
        tracing::info!(task = %task.id, "task validated");

        let task_id = task.id.clone();
        self.store
            .update_state(move |state| state.completed_tasks.push(task))
            .await?;
        self.store
            .post_message(&SwarmMessage::new(
                "task_completed",
                "validator",
                "commander",
                json!({ "task_id": task_id }),
            ))
            .await?;
        Ok(())
    }

    async fn retry_or_fail(&self, mut task: SwarmTask) -> Result<()> {
        if task.retry_count < task.max_retries {
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            task.result = None;
            task.touch();
            tracing::info!(task = %task.id, retry = task.retry_count, "task requeued");
            self.store.enqueue_goal(&task).await?;
            return Ok(());
        }

        task.status = TaskStatus::Failed;
        task.touch();
        tracing::warn!(task = %task.id, "task failed permanently");

        let task_id = task.id.clone();
        self.store
            .update_state(move |state| state.failed_tasks.push(task))
            .await?;
        self.store
            .post_message(&SwarmMessage::new(
                "task_failed",
                "validator",
                "commander",
                json!({ "task_id": task_id }),
            ))
            .await?;
        Ok(())
    }
}
