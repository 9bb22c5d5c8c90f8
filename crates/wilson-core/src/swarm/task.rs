//! Swarm task and state types.
//!
//! These are the shapes persisted under the swarm directory: tasks flow
//! through `goal-queue.jsonl` and `completion-queue.jsonl` one JSON object
//! per line, and `state.json` holds the canonical [`SwarmState`] snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Validating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmTask {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Directory the executing worker should run in; defaults to the swarm's
    /// working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SwarmTask {
    pub fn new(description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority: 0,
            depends_on: Vec::new(),
            retry_count: 0,
            max_retries: default_max_retries(),
            result: None,
            working_dir: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A task is runnable iff it is pending and every dependency id is in
    /// the completed set.
    pub fn is_runnable(&self, completed: &HashSet<String>) -> bool {
        self.status == TaskStatus::Pending
            && self.depends_on.iter().all(|dep| completed.contains(dep))
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStatus {
    Initializing,
    Running,
    Completed,
    Failed,
}

/// One worker or validator process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub tasks_failed: u32,
}

/// Canonical swarm snapshot, persisted to `state.json` under the lock.
/// Read-only readers may load it without the lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmState {
    pub goal: String,
    pub status: SwarmStatus,
    #[serde(default)]
    pub workers: Vec<AgentRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<AgentRecord>,
    #[serde(default)]
    pub completed_tasks: Vec<SwarmTask>,
    #[serde(default)]
    pub failed_tasks: Vec<SwarmTask>,
    #[serde(default)]
    pub total_tasks: usize,
    /// Percentage of tasks in a terminal state.
    #[serde(default)]
    pub progress: u8,
}

impl SwarmState {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            status: SwarmStatus::Initializing,
            workers: Vec::new(),
            validator: None,
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            total_tasks: 0,
            progress: 0,
        }
    }

    pub fn completed_ids(&self) -> HashSet<String> {
        self.completed_tasks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn terminal_task_count(&self) -> usize {
        self.completed_tasks.len() + self.failed_tasks.len()
    }

    pub fn recompute_progress(&mut self) {
        self.progress = if self.total_tasks == 0 {
            0
        } else {
            (self.terminal_task_count() * 100 / self.total_tasks).min(100) as u8
        };
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SwarmStatus::Completed | SwarmStatus::Failed)
    }
}
