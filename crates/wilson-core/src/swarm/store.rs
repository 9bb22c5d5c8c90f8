//! Lock-mediated swarm file store.
//!
//! Layout under the swarm root:
//!
//! - `goal-queue.jsonl` — pending tasks, append on enqueue, rewrite on dequeue
//! - `completion-queue.jsonl` — tasks awaiting validation
//! - `state.json` — canonical [`SwarmState`], written atomically
//! - `messages.jsonl` — typed inter-agent messages
//! - `lock` — advisory lock owning every read-modify-write above
//!
//! Read-only reads of `state.json` bypass the lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::lock::SwarmLock;
use super::task::{SwarmState, SwarmTask, TaskStatus};

pub const STATE_FILE: &str = "state.json";
pub const GOAL_QUEUE_FILE: &str = "goal-queue.jsonl";
pub const COMPLETION_QUEUE_FILE: &str = "completion-queue.jsonl";
pub const MESSAGES_FILE: &str = "messages.jsonl";
pub const LOCK_FILE: &str = "lock";

/// One inter-agent message line in `messages.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    pub to: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl SwarmMessage {
    pub fn new(kind: &str, from: &str, to: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct SwarmStore {
    root: PathBuf,
    lock: SwarmLock,
}

impl SwarmStore {
    pub fn new(root: PathBuf) -> Self {
        let lock = SwarmLock::new(root.join(LOCK_FILE));
        Self { root, lock }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating swarm dir {}", self.root.display()))?;
        Ok(())
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    // ── goal queue ─────────────────────────────────────────────────────

    pub async fn enqueue_goal(&self, task: &SwarmTask) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        append_jsonl(&self.path(GOAL_QUEUE_FILE), task)
    }

    /// Pop the first pending task whose dependencies are all completed,
    /// mark it in_progress, and rewrite the queue without it.
    pub async fn dequeue_goal(&self) -> Result<Option<SwarmTask>> {
        let _guard = self.lock.acquire().await?;

        let completed = self
            .load_state_unlocked()?
            .map(|s| s.completed_ids())
            .unwrap_or_default();

        let mut queue: Vec<SwarmTask> = read_jsonl(&self.path(GOAL_QUEUE_FILE))?;
        let Some(position) = queue.iter().position(|t| t.is_runnable(&completed)) else {
            return Ok(None);
        };

        let mut task = queue.remove(position);
        task.status = TaskStatus::InProgress;
        task.touch();
        write_jsonl(&self.path(GOAL_QUEUE_FILE), &queue)?;
        Ok(Some(task))
    }

    /// Snapshot without the lock; callers must treat it as advisory.
    pub fn read_goal_queue(&self) -> Result<Vec<SwarmTask>> {
        read_jsonl(&self.path(GOAL_QUEUE_FILE))
    }

    // ── completion queue ───────────────────────────────────────────────

    pub async fn push_completion(&self, task: &SwarmTask) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        append_jsonl(&self.path(COMPLETION_QUEUE_FILE), task)
    }

    pub async fn pop_completion(&self) -> Result<Option<SwarmTask>> {
        let _guard = self.lock.acquire().await?;
        let mut queue: Vec<SwarmTask> = read_jsonl(&self.path(COMPLETION_QUEUE_FILE))?;
        if queue.is_empty() {
            return Ok(None);
        }
        let task = queue.remove(0);
        write_jsonl(&self.path(COMPLETION_QUEUE_FILE), &queue)?;
        Ok(Some(task))
    }

    pub fn read_completion_queue(&self) -> Result<Vec<SwarmTask>> {
        read_jsonl(&self.path(COMPLETION_QUEUE_FILE))
    }

    // ── state ──────────────────────────────────────────────────────────

    /// Read-only state load; bypasses the lock by design.
    pub fn load_state(&self) -> Result<Option<SwarmState>> {
        self.load_state_unlocked()
    }

    fn load_state_unlocked(&self) -> Result<Option<SwarmState>> {
        let path = self.path(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub async fn save_state(&self, state: &SwarmState) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        self.write_state_atomic(state)
    }

    /// Locked read-modify-write of the state snapshot.
    pub async fn update_state<F>(&self, mutate: F) -> Result<SwarmState>
    where
        F: FnOnce(&mut SwarmState),
    {
        let _guard = self.lock.acquire().await?;
        let mut state = self
            .load_state_unlocked()?
            .context("swarm state not initialized")?;
        mutate(&mut state);
        state.recompute_progress();
        self.write_state_atomic(&state)?;
        Ok(state)
    }

    fn write_state_atomic(&self, state: &SwarmState) -> Result<()> {
        let path = self.path(STATE_FILE);
        let tmp = self.path(".state.json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    // ── messages ───────────────────────────────────────────────────────

    pub async fn post_message(&self, message: &SwarmMessage) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        append_jsonl(&self.path(MESSAGES_FILE), message)
    }

    pub fn read_messages(&self) -> Result<Vec<SwarmMessage>> {
        read_jsonl(&self.path(MESSAGES_FILE))
    }
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path)?;
    let mut items = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        items.push(
            serde_json::from_str(line)
                .with_context(|| format!("malformed line in {}", path.display()))?,
        );
    }
    Ok(items)
}

fn append_jsonl<T: Serialize>(path: &Path, item: &T) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", serde_json::to_string(item)?)?;
    Ok(())
}

fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    let tmp = path.with_extension("jsonl.tmp");
    let mut out = String::new();
    for item in items {
        out.push_str(&serde_json::to_string(item)?);
        out.push('\n');
    }
    std::fs::write(&tmp, out)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::task::SwarmStatus;

    fn store() -> (tempfile::TempDir, SwarmStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SwarmStore::new(dir.path().join("swarm"));
        store.init().unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_marks_in_progress() {
        let (_dir, store) = store();
        store
            .save_state(&SwarmState::new("goal"))
            .await
            .unwrap();

        let task = SwarmTask::new("task a");
        store.enqueue_goal(&task).await.unwrap();

        let popped = store.dequeue_goal().await.unwrap().unwrap();
        assert_eq!(popped.id, task.id);
        assert_eq!(popped.status, TaskStatus::InProgress);
        assert!(store.read_goal_queue().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocked_dependencies_are_skipped() {
        let (_dir, store) = store();
        let mut state = SwarmState::new("goal");

        let done = SwarmTask::new("already done");
        let mut blocked = SwarmTask::new("needs missing dep");
        blocked.depends_on = vec!["nope".to_string()];
        let mut ready = SwarmTask::new("needs done dep");
        ready.depends_on = vec![done.id.clone()];

        state.completed_tasks.push(done);
        store.save_state(&state).await.unwrap();

        store.enqueue_goal(&blocked).await.unwrap();
        store.enqueue_goal(&ready).await.unwrap();

        let popped = store.dequeue_goal().await.unwrap().unwrap();
        assert_eq!(popped.id, ready.id);

        // Only the blocked task remains, and it stays unrunnable.
        assert!(store.dequeue_goal().await.unwrap().is_none());
        assert_eq!(store.read_goal_queue().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completion_queue_is_fifo() {
        let (_dir, store) = store();
        let a = SwarmTask::new("a");
        let b = SwarmTask::new("b");
        store.push_completion(&a).await.unwrap();
        store.push_completion(&b).await.unwrap();

        assert_eq!(store.pop_completion().await.unwrap().unwrap().id, a.id);
        assert_eq!(store.pop_completion().await.unwrap().unwrap().id, b.id);
        assert!(store.pop_completion().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn state_update_recomputes_progress() {
        let (_dir, store) = store();
        let mut state = SwarmState::new("goal");
        state.status = SwarmStatus::Running;
        state.total_tasks = 2;
        store.save_state(&state).await.unwrap();

        let updated = store
            .update_state(|s| s.completed_tasks.push(SwarmTask::new("a")))
            .await
            .unwrap();
        assert_eq!(updated.progress, 50);

        let loaded = store.load_state().unwrap().unwrap();
        assert_eq!(loaded, updated);
    }

    #[tokio::test]
    async fn messages_append_in_order() {
        let (_dir, store) = store();
        store
            .post_message(&SwarmMessage::new(
                "task_ready",
                "worker-1",
                "validator",
                serde_json::json!({"task_id": "t1"}),
            ))
            .await
            .unwrap();
        store
            .post_message(&SwarmMessage::new(
                "task_completed",
                "validator",
                "commander",
                serde_json::json!({"task_id": "t1"}),
            ))
            .await
            .unwrap();

        let messages = store.read_messages().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, "task_ready");
        assert_eq!(messages[1].from, "validator");
    }

    #[tokio::test]
    async fn lock_file_never_lingers() {
        let (_dir, store) = store();
        store.save_state(&SwarmState::new("g")).await.unwrap();
        store.enqueue_goal(&SwarmTask::new("t")).await.unwrap();
        assert!(!store.root().join(LOCK_FILE).exists());
    }
}
