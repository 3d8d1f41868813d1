// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The DAG executor: one execution unit per subtask.
//!
//! Every subtask launches concurrently. A unit parks on the first of the
//! task's cancel signal and its pending dependencies' terminal signals,
//! re-examining after each wake; once all dependencies are terminal it
//! renders its prompt from sibling results and runs the ask. Subtask errors
//! stay local (siblings keep running) while task cancellation cascades.

use crate::graph::{self, SubtaskSpec};
use crate::store::{SubtaskRecord, TaskRecord, TaskStore};
use crate::template;
use acp_bridge_agents::AgentRegistry;
use acp_bridge_types::{ActiveTask, BridgeError, BridgeResult, TaskState, TaskStatus};
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// The scheduler's seam to the agent layer: run one prompt, and cancel an
/// agent when its active claim still belongs to a task.
#[async_trait]
pub trait PromptRunner: Send + Sync {
    async fn run_prompt(
        &self,
        agent: &str,
        prompt: &str,
        claim: ActiveTask,
    ) -> BridgeResult<String>;

    /// Issue an agent-level cancel if the agent's `activeTask` marker still
    /// belongs to `task_id`. Returns whether a cancel was issued.
    async fn cancel_for_task(&self, agent: &str, task_id: &str) -> bool;
}

#[async_trait]
impl PromptRunner for AgentRegistry {
    async fn run_prompt(
        &self,
        agent: &str,
        prompt: &str,
        claim: ActiveTask,
    ) -> BridgeResult<String> {
        self.ask(agent, prompt, Some(claim))
            .await
            .map(|outcome| outcome.response)
    }

    async fn cancel_for_task(&self, agent: &str, task_id: &str) -> bool {
        let Some(handle) = self.get(agent).await else {
            return false;
        };
        let claimed = handle
            .active_task()
            .map(|claim| claim.task_id == task_id)
            .unwrap_or(false);
        if !claimed {
            return false;
        }
        self.cancel(agent).await.is_ok()
    }
}

pub struct TaskScheduler {
    store: Arc<TaskStore>,
    runner: Arc<dyn PromptRunner>,
}

impl TaskScheduler {
    pub fn new(store: Arc<TaskStore>, runner: Arc<dyn PromptRunner>) -> Arc<Self> {
        Arc::new(Self { store, runner })
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Validate, store, and launch a task. One execution unit per subtask.
    pub fn create(&self, name: &str, specs: &[SubtaskSpec]) -> BridgeResult<TaskStatus> {
        let validated = graph::validate(name, specs).map_err(BridgeError::Validation)?;
        let task = TaskRecord::new(name.trim(), validated);
        self.store.insert(Arc::clone(&task));
        info!(task_id = %task.id, name = %task.name, subtasks = task.subtasks.len(), "task created");

        for subtask in &task.subtasks {
            tokio::spawn(run_subtask(
                Arc::clone(&self.store),
                Arc::clone(&self.runner),
                Arc::clone(&task),
                Arc::clone(subtask),
            ));
        }
        Ok(task.status())
    }

    /// Cancel a task: wake every waiter, mark non-terminal subtasks
    /// cancelled, ACP-cancel agents still working for this task, and trigger
    /// eviction. Returns the number of subtasks transitioned to cancelled.
    pub async fn cancel(&self, id: &str) -> BridgeResult<usize> {
        let task = self
            .store
            .get(id)
            .ok_or_else(|| BridgeError::TaskNotFound(id.to_string()))?;

        task.cancel_requested.store(true, Ordering::SeqCst);
        task.cancel_signal.cancel();
        task.set_state(TaskState::Cancelled);

        let mut cancelled = 0usize;
        let mut running: Vec<Arc<SubtaskRecord>> = Vec::new();
        for subtask in &task.subtasks {
            let was_running = subtask.state() == acp_bridge_types::SubtaskState::Running;
            if subtask.mark_cancelled() {
                cancelled += 1;
                if was_running {
                    running.push(Arc::clone(subtask));
                }
            }
        }

        for subtask in running {
            if self.runner.cancel_for_task(&subtask.agent, &task.id).await {
                debug!(task_id = %task.id, subtask_id = %subtask.id, agent = %subtask.agent, "agent cancelled for task");
            }
        }

        self.store.evict();
        info!(task_id = %task.id, cancelled, "task cancelled");
        Ok(cancelled)
    }
}

/// Wait until every dependency is terminal. Event-driven: parks on the first
/// of the cancel signal and the pending dependencies' terminal signals, then
/// re-examines. Returns false when the task was cancelled meanwhile.
async fn wait_for_dependencies(task: &TaskRecord, subtask: &SubtaskRecord) -> bool {
    loop {
        if task.cancel_requested() || task.cancel_signal.is_cancelled() {
            return false;
        }
        let pending: Vec<Arc<SubtaskRecord>> = subtask
            .depends_on
            .iter()
            .filter_map(|id| task.subtask(id))
            .filter(|dep| !dep.is_terminal())
            .collect();
        if pending.is_empty() {
            return true;
        }

        let waits = pending.iter().map(|dep| Box::pin(dep.terminal.cancelled()));
        tokio::select! {
            _ = task.cancel_signal.cancelled() => {}
            _ = futures::future::select_all(waits) => {}
        }
    }
}

async fn run_subtask(
    store: Arc<TaskStore>,
    runner: Arc<dyn PromptRunner>,
    task: Arc<TaskRecord>,
    subtask: Arc<SubtaskRecord>,
) {
    if !wait_for_dependencies(&task, &subtask).await {
        if subtask.mark_cancelled() {
            debug!(task_id = %task.id, subtask_id = %subtask.id, "subtask cancelled before start");
        }
        task.recompute_state();
        store.evict();
        return;
    }

    let prompt = template::render(&subtask.prompt, &task.results_by_id());
    if !subtask.mark_running() {
        // Raced with cancellation after the wait.
        task.recompute_state();
        return;
    }
    debug!(task_id = %task.id, subtask_id = %subtask.id, agent = %subtask.agent, "subtask running");

    let claim = ActiveTask {
        task_id: task.id.clone(),
        subtask_id: subtask.id.clone(),
    };
    match runner.run_prompt(&subtask.agent, &prompt, claim).await {
        Ok(result) => {
            subtask.mark_done(result);
            info!(task_id = %task.id, subtask_id = %subtask.id, "subtask done");
        }
        Err(err) => {
            // Local failure: siblings keep running.
            subtask.mark_error(err.to_string());
            info!(task_id = %task.id, subtask_id = %subtask.id, error = %err, "subtask failed");
        }
    }

    task.recompute_state();
    store.evict();
}
