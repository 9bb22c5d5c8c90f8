//! Swarm worker: dequeue → run the agent loop → push for validation.
//!
//! Workers run with auto-approve permissions; there is nobody at the
//! keyboard. Task failures are captured into the result and still pushed to
//! the completion queue so the validator decides about retries — a worker
//! never crashes on a bad task.

use anyhow::Result;
use serde_json::json;
use std::time::Duration;

use crate::agent::{AgentLoop, LoopConfig, LoopEvent, LoopServices};
use crate::ai::types::Conversation;

use super::store::{SwarmMessage, SwarmStore};
use super::task::{SwarmTask, TaskResult, TaskStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct Worker {
    id: String,
    store: SwarmStore,
    services: LoopServices,
    loop_config: LoopConfig,
}

impl Worker {
    pub fn new(id: String, store: SwarmStore, services: LoopServices, loop_config: LoopConfig) -> Self {
        Self {
            id,
            store,
            services,
            loop_config,
        }
    }

    /// Run until the swarm reaches a terminal state.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(worker = %self.id, "worker started");

        loop {
            // Terminal-state observation is a read-only state load.
            if let Some(state) = self.store.load_state()? {
                if state.is_terminal() {
                    break;
                }
            }

            let Some(task) = self.store.dequeue_goal().await? else {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            };

            tracing::info!(worker = %self.id, task = %task.id, "task picked up");
            let result = self.execute(&task).await;
            let success = result.success;

            let mut finished = task;
            finished.status = TaskStatus::Validating;
            finished.result = Some(result);
            finished.touch();
            let task_id = finished.id.clone();
            self.store.push_completion(&finished).await?;

            let worker_id = self.id.clone();
            self.store
                .update_state(move |state| {
                    if let Some(record) = state.workers.iter_mut().find(|w| w.id == worker_id) {
                        if success {
                            record.tasks_completed += 1;
                        } else {
                            record.tasks_failed += 1;
                        }
                    }
                })
                .await?;

            self.store
                .post_message(&SwarmMessage::new(
                    "task_ready",
                    &self.id,
                    "validator",
                    json!({ "task_id": task_id, "success": success }),
                ))
                .await?;
        }

        tracing::info!(worker = %self.id, "worker exiting");
        Ok(())
    }

    /// Drive one task through the agent loop. Every failure mode is folded
    /// into a [`TaskResult`].
    async fn execute(&self, task: &SwarmTask) -> TaskResult {
        let mut config = self.loop_config.clone();
        if let Some(dir) = &task.working_dir {
            config.working_dir = dir.clone();
        }

        let agent = AgentLoop::new(self.services.clone(), config);
        let mut handle = agent.send(Conversation::new(), task.description.clone());

        let mut error: Option<String> = None;
        while let Some(event) = handle.events.recv().await {
            if let LoopEvent::Error { message } = event {
                error = Some(message);
            }
        }

        let conversation = match handle.done.await {
            Ok(conversation) => conversation,
            Err(e) => {
                tracing::error!(worker = %self.id, task = %task.id, "agent task panicked: {}", e);
                return TaskResult {
                    success: false,
                    summary: String::new(),
                    error: Some(format!("agent task panicked: {}", e)),
                };
            }
        };

        let summary = conversation
            .messages
            .last()
            .map(|m| m.text())
            .unwrap_or_default();

        match error {
            Some(error) => TaskResult {
                success: false,
                summary,
                error: Some(error),
            },
            None => TaskResult {
                success: true,
                summary,
                error: None,
            },
        }
    }
}
