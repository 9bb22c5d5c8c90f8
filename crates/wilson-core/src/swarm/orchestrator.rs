//! Swarm commander: goal decomposition, process lifecycle, and completion
//! detection.
//!
//! The commander decomposes the goal into tasks via the backend, enqueues
//! them, launches worker and validator OS processes (re-invoking the current
//! executable's `swarm worker` / `swarm validator` subcommands), and then
//! watches the lock-mediated files until the swarm drains. Workers and the
//! validator observe the terminal state themselves and exit.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::ai::backend::Backend;
use crate::ai::sse::StreamEvent;
use crate::ai::types::ChatMessage;

use super::store::{SwarmMessage, SwarmStore};
use super::task::{AgentRecord, SwarmState, SwarmStatus, SwarmTask};

pub const DEFAULT_SWARM_DIR: &str = ".wilson-swarm";

const MONITOR_INTERVAL: Duration = Duration::from_secs(1);
const CHILD_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Directory name under the working dir holding the swarm files.
    pub dir_name: String,
    pub workers: usize,
    pub max_retries: u32,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            dir_name: DEFAULT_SWARM_DIR.to_string(),
            workers: 2,
            max_retries: 2,
        }
    }
}

pub struct SwarmOrchestrator {
    config: SwarmConfig,
    store: SwarmStore,
    backend: Arc<dyn Backend>,
    working_dir: PathBuf,
}

impl SwarmOrchestrator {
    pub fn new(working_dir: PathBuf, config: SwarmConfig, backend: Arc<dyn Backend>) -> Self {
        let store = SwarmStore::new(working_dir.join(&config.dir_name));
        Self {
            config,
            store,
            backend,
            working_dir,
        }
    }

    pub fn store(&self) -> &SwarmStore {
        &self.store
    }

    /// Run a whole swarm to completion and return the final state.
    pub async fn run(&self, goal: &str) -> Result<SwarmState> {
        self.store.init()?;
        self.store.save_state(&SwarmState::new(goal)).await?;

        // Decompose and enqueue.
        let tasks = self.decompose(goal).await?;
        let total = tasks.len();
        tracing::info!(total, "goal decomposed");
        for task in &tasks {
            self.store.enqueue_goal(task).await?;
        }

        self.store
            .update_state(|state| {
                state.status = SwarmStatus::Running;
                state.total_tasks = total;
            })
            .await?;

        // Launch the fleet.
        let mut children = Vec::new();
        for index in 0..self.config.workers {
            let id = format!("worker-{}", index + 1);
            let child = self.spawn_role(&["swarm", "worker", "--id", &id])?;
            let record = AgentRecord {
                id: id.clone(),
                pid: child.id().unwrap_or(0),
                started_at: Utc::now(),
                tasks_completed: 0,
                tasks_failed: 0,
            };
            self.store
                .update_state(move |state| state.workers.push(record))
                .await?;
            children.push(child);
        }
        let validator_child = self.spawn_role(&["swarm", "validator"])?;
        let validator_record = AgentRecord {
            id: "validator".to_string(),
            pid: validator_child.id().unwrap_or(0),
            started_at: Utc::now(),
            tasks_completed: 0,
            tasks_failed: 0,
        };
        self.store
            .update_state(move |state| state.validator = Some(validator_record))
            .await?;
        children.push(validator_child);

        self.store
            .post_message(&SwarmMessage::new(
                "swarm_started",
                "commander",
                "*",
                serde_json::json!({ "goal": goal, "tasks": total }),
            ))
            .await?;

        // Monitor until drained.
        let final_state = loop {
            tokio::time::sleep(MONITOR_INTERVAL).await;
            if let Some(state) = check_completion(&self.store).await? {
                break state;
            }
        };

        // Children observe the terminal state and exit on their own; give
        // them the grace period before reaping.
        for mut child in children {
            match tokio::time::timeout(CHILD_SHUTDOWN_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(pid = ?child.id(), "child ignored shutdown, killing");
                    let _ = child.kill().await;
                }
            }
        }

        tracing::info!(status = ?final_state.status, progress = final_state.progress, "swarm finished");
        Ok(final_state)
    }

    fn spawn_role(&self, args: &[&str]) -> Result<tokio::process::Child> {
        let exe = std::env::current_exe().context("resolving current executable")?;
        let mut cmd = tokio::process::Command::new(exe);
        cmd.args(args)
            .arg("--dir")
            .arg(&self.working_dir)
            .arg("--swarm-dir")
            .arg(&self.config.dir_name)
            .current_dir(&self.working_dir)
            .kill_on_drop(true);
        let child = cmd.spawn().context("spawning swarm role")?;
        tracing::info!(pid = ?child.id(), ?args, "swarm role spawned");
        Ok(child)
    }

    /// Ask the backend to decompose the goal into tasks. Falls back to a
    /// single task covering the whole goal when the response is unusable.
    async fn decompose(&self, goal: &str) -> Result<Vec<SwarmTask>> {
        let prompt = format!(
            "Decompose this goal into 2-8 independent tasks for parallel workers. \
             Respond with only a JSON array; each element is \
             {{\"description\": string, \"depends_on\": [task indices], \"priority\": number}}. \
             Earlier tasks may be dependencies of later ones.\n\nGoal: {}",
            goal
        );

        let text = match self.complete_text(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("decomposition request failed, using single task: {}", e);
                return Ok(vec![self.single_task(goal)]);
            }
        };

        match parse_task_plan(&text, self.config.max_retries) {
            Some(tasks) if !tasks.is_empty() => Ok(tasks),
            _ => {
                tracing::warn!("unusable decomposition, using single task");
                Ok(vec![self.single_task(goal)])
            }
        }
    }

    fn single_task(&self, goal: &str) -> SwarmTask {
        let mut task = SwarmTask::new(goal);
        task.max_retries = self.config.max_retries;
        task
    }

    async fn complete_text(&self, prompt: &str) -> Result<String> {
        let cancel = CancellationToken::new();
        let messages = vec![ChatMessage::user_text(prompt)];
        let mut rx = self.backend.stream_chat(&messages, &cancel).await?;

        let mut text = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Text { text: chunk } => text.push_str(&chunk),
                StreamEvent::Error { message } => anyhow::bail!("backend error: {}", message),
                StreamEvent::Done => break,
                _ => {}
            }
        }
        Ok(text)
    }
}

/// Completion detection: both queues empty and every task in a terminal set.
/// Finalizes and returns the state when the swarm is done, `None` otherwise.
pub async fn check_completion(store: &SwarmStore) -> Result<Option<SwarmState>> {
    let Some(state) = store.load_state()? else {
        return Ok(None);
    };
    if state.status == SwarmStatus::Initializing {
        return Ok(None);
    }

    let goal_pending = store.read_goal_queue()?.len();
    let completion_pending = store.read_completion_queue()?.len();
    if goal_pending > 0 || completion_pending > 0 {
        return Ok(None);
    }
    if state.terminal_task_count() < state.total_tasks {
        return Ok(None);
    }

    let final_state = store
        .update_state(|state| {
            state.status = if state.failed_tasks.is_empty() {
                SwarmStatus::Completed
            } else {
                SwarmStatus::Failed
            };
        })
        .await?;
    Ok(Some(final_state))
}

#[derive(Deserialize)]
struct PlannedTask {
    description: String,
    #[serde(default)]
    depends_on: Vec<usize>,
    #[serde(default)]
    priority: i64,
}

/// Extract the first JSON array from the model's reply and map planned
/// dependency indices onto generated task ids.
fn parse_task_plan(text: &str, max_retries: u32) -> Option<Vec<SwarmTask>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }

    let planned: Vec<PlannedTask> = serde_json::from_str(&text[start..=end]).ok()?;

    let mut tasks: Vec<SwarmTask> = planned
        .iter()
        .map(|p| {
            let mut task = SwarmTask::new(&p.description);
            task.priority = p.priority;
            task.max_retries = max_retries;
            task
        })
        .collect();

    let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    for (task, planned) in tasks.iter_mut().zip(&planned) {
        task.depends_on = planned
            .depends_on
            .iter()
            .filter_map(|&index| ids.get(index).cloned())
            .collect();
    }

    Some(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::task::TaskStatus;

    #[test]
    fn parses_a_plan_with_dependencies() {
        let reply = r#"Here is the plan:
[
  {"description": "scaffold the project", "depends_on": [], "priority": 2},
  {"description": "implement the parser", "depends_on": [0]},
  {"description": "write integration tests", "depends_on": [0, 1], "priority": -1}
]
Good luck!"#;

        let tasks = parse_task_plan(reply, 3).unwrap();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].priority, 2);
        assert!(tasks[0].depends_on.is_empty());
        assert_eq!(tasks[1].depends_on, vec![tasks[0].id.clone()]);
        assert_eq!(
            tasks[2].depends_on,
            vec![tasks[0].id.clone(), tasks[1].id.clone()]
        );
        assert!(tasks.iter().all(|t| t.max_retries == 3));
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[test]
    fn garbage_yields_none() {
        assert!(parse_task_plan("no json here", 2).is_none());
        assert!(parse_task_plan("[not valid json]", 2).is_none());
    }

    #[test]
    fn out_of_range_dependency_indices_are_dropped() {
        let reply = r#"[{"description": "a", "depends_on": [7]}]"#;
        let tasks = parse_task_plan(reply, 2).unwrap();
        assert!(tasks[0].depends_on.is_empty());
    }

    #[tokio::test]
    async fn completion_requires_drained_queues_and_terminal_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = SwarmStore::new(dir.path().join("swarm"));
        store.init().unwrap();

        let mut state = SwarmState::new("goal");
        state.status = SwarmStatus::Running;
        state.total_tasks = 1;
        store.save_state(&state).await.unwrap();

        // Task still queued: not complete.
        let task = SwarmTask::new("t");
        store.enqueue_goal(&task).await.unwrap();
        assert!(check_completion(&store).await.unwrap().is_none());

        // Drained and completed: complete.
        store.dequeue_goal().await.unwrap();
        store
            .update_state(|s| s.completed_tasks.push(task))
            .await
            .unwrap();
        let done = check_completion(&store).await.unwrap().unwrap();
        assert_eq!(done.status, SwarmStatus::Completed);
        assert_eq!(done.progress, 100);
    }
}
