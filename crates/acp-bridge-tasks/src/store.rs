// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Task and subtask records plus the process-wide task store.
//!
//! Terminal transitions fire a one-shot broadcast signal (a
//! `CancellationToken`) that dependency waiters and cancellation select on.
//! The store evicts terminal tasks by TTL and by a capacity cap; running
//! tasks are never evicted.

use crate::graph::ValidatedSubtask;
use acp_bridge_types::{SubtaskState, SubtaskStatus, TaskState, TaskStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Default cap on retained terminal tasks (`ACP_BRIDGE_MAX_TASKS`).
pub const DEFAULT_MAX_COMPLETED_TASKS: usize = 100;
/// Default terminal-task TTL (`ACP_BRIDGE_TASK_TTL_MS`).
pub const DEFAULT_TASK_TTL: Duration = Duration::from_millis(3_600_000);
/// Cadence of the background eviction sweep.
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct SubtaskMeta {
    state: SubtaskState,
    result: Option<String>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

/// One subtask of a task. The terminal token fires exactly once, on the
/// transition into done/error/cancelled.
pub struct SubtaskRecord {
    pub id: String,
    pub agent: String,
    pub prompt: String,
    pub depends_on: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub terminal: CancellationToken,
    meta: Mutex<SubtaskMeta>,
}

impl SubtaskRecord {
    fn new(spec: ValidatedSubtask) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id,
            agent: spec.agent,
            prompt: spec.prompt,
            depends_on: spec.depends_on,
            created_at: now,
            terminal: CancellationToken::new(),
            meta: Mutex::new(SubtaskMeta {
                state: SubtaskState::Pending,
                result: None,
                error: None,
                started_at: None,
                completed_at: None,
                updated_at: now,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SubtaskMeta> {
        self.meta.lock().expect("subtask lock poisoned")
    }

    pub fn state(&self) -> SubtaskState {
        self.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn result(&self) -> Option<String> {
        self.lock().result.clone()
    }

    /// Pending → running. Returns false when the subtask was already moved
    /// out of pending (e.g. cancelled while waiting).
    pub fn mark_running(&self) -> bool {
        let mut meta = self.lock();
        if meta.state != SubtaskState::Pending {
            return false;
        }
        meta.state = SubtaskState::Running;
        let now = Utc::now();
        meta.started_at = Some(now);
        meta.updated_at = now;
        true
    }

    pub fn mark_done(&self, result: String) -> bool {
        self.finish(SubtaskState::Done, Some(result), None)
    }

    pub fn mark_error(&self, error: String) -> bool {
        self.finish(SubtaskState::Error, None, Some(error))
    }

    pub fn mark_cancelled(&self) -> bool {
        self.finish(SubtaskState::Cancelled, None, None)
    }

    fn finish(
        &self,
        state: SubtaskState,
        result: Option<String>,
        error: Option<String>,
    ) -> bool {
        {
            let mut meta = self.lock();
            if meta.state.is_terminal() {
                return false;
            }
            meta.state = state;
            meta.result = result;
            meta.error = error;
            let now = Utc::now();
            meta.completed_at = Some(now);
            meta.updated_at = now;
        }
        self.terminal.cancel();
        true
    }

    pub fn status(&self) -> SubtaskStatus {
        let meta = self.lock();
        SubtaskStatus {
            id: self.id.clone(),
            agent: self.agent.clone(),
            prompt: self.prompt.clone(),
            depends_on: self.depends_on.clone(),
            state: meta.state,
            result: meta.result.clone(),
            error: meta.error.clone(),
            created_at: self.created_at,
            updated_at: meta.updated_at,
            started_at: meta.started_at,
            completed_at: meta.completed_at,
        }
    }
}

#[derive(Debug)]
struct TaskMeta {
    state: TaskState,
    updated_at: DateTime<Utc>,
}

/// One task: an immutable subtask graph plus mutable task-level state.
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub cancel_requested: AtomicBool,
    pub cancel_signal: CancellationToken,
    pub subtasks: Vec<Arc<SubtaskRecord>>,
    meta: Mutex<TaskMeta>,
}

impl TaskRecord {
    pub fn new(name: &str, subtasks: Vec<ValidatedSubtask>) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: now,
            cancel_requested: AtomicBool::new(false),
            cancel_signal: CancellationToken::new(),
            subtasks: subtasks.into_iter().map(|s| Arc::new(SubtaskRecord::new(s))).collect(),
            meta: Mutex::new(TaskMeta {
                state: TaskState::Running,
                updated_at: now,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TaskMeta> {
        self.meta.lock().expect("task lock poisoned")
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.lock().updated_at
    }

    pub fn set_state(&self, state: TaskState) {
        let mut meta = self.lock();
        meta.state = state;
        meta.updated_at = Utc::now();
    }

    pub fn subtask(&self, id: &str) -> Option<Arc<SubtaskRecord>> {
        self.subtasks.iter().find(|s| s.id == id).cloned()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Sibling results keyed by id, for prompt templating.
    pub fn results_by_id(&self) -> HashMap<String, Option<String>> {
        self.subtasks
            .iter()
            .map(|s| (s.id.clone(), s.result()))
            .collect()
    }

    /// Derive the task state from its subtasks after any transition.
    /// A user-cancelled task stays cancelled.
    pub fn recompute_state(&self) -> TaskState {
        let mut meta = self.lock();
        if meta.state == TaskState::Cancelled {
            return TaskState::Cancelled;
        }
        let states: Vec<SubtaskState> = self.subtasks.iter().map(|s| s.state()).collect();
        let next = if states
            .iter()
            .any(|s| matches!(s, SubtaskState::Pending | SubtaskState::Running))
        {
            TaskState::Running
        } else if states.iter().all(|s| *s == SubtaskState::Done) {
            TaskState::Done
        } else if states.iter().all(|s| *s == SubtaskState::Cancelled) {
            TaskState::Cancelled
        } else if states.iter().any(|s| *s == SubtaskState::Error) {
            TaskState::Error
        } else {
            TaskState::Running
        };
        if next != meta.state {
            meta.state = next;
            meta.updated_at = Utc::now();
        }
        next
    }

    pub fn status(&self) -> TaskStatus {
        let meta = self.lock();
        TaskStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            state: meta.state,
            subtasks: self.subtasks.iter().map(|s| s.status()).collect(),
            created_at: self.created_at,
            updated_at: meta.updated_at,
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_for_tests(&self, age: Duration) {
        let mut meta = self.lock();
        meta.updated_at = Utc::now()
            - ChronoDuration::from_std(age).unwrap_or_else(|_| ChronoDuration::zero());
    }
}

/// Process-wide registry of tasks with TTL- and capacity-based eviction of
/// terminal entries.
pub struct TaskStore {
    tasks: Mutex<HashMap<String, Arc<TaskRecord>>>,
    max_completed: usize,
    ttl: Duration,
}

impl TaskStore {
    pub fn new(max_completed: usize, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            max_completed,
            ttl,
        })
    }

    pub fn insert(&self, task: Arc<TaskRecord>) {
        self.tasks
            .lock()
            .expect("task store lock poisoned")
            .insert(task.id.clone(), task);
    }

    pub fn get(&self, id: &str) -> Option<Arc<TaskRecord>> {
        self.tasks
            .lock()
            .expect("task store lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<TaskRecord>> {
        let mut tasks: Vec<Arc<TaskRecord>> = self
            .tasks
            .lock()
            .expect("task store lock poisoned")
            .values()
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("task store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired terminal tasks, then the oldest terminal tasks beyond
    /// the capacity cap. Runs on every terminal transition and on a timer.
    pub fn evict(&self) {
        let ttl = ChronoDuration::from_std(self.ttl).unwrap_or_else(|_| ChronoDuration::zero());
        let cutoff = Utc::now() - ttl;
        let mut tasks = self.tasks.lock().expect("task store lock poisoned");

        let expired: Vec<String> = tasks
            .values()
            .filter(|t| t.state().is_terminal() && t.updated_at() < cutoff)
            .map(|t| t.id.clone())
            .collect();
        for id in &expired {
            tasks.remove(id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "evicted expired tasks");
        }

        let mut terminal: Vec<Arc<TaskRecord>> = tasks
            .values()
            .filter(|t| t.state().is_terminal())
            .cloned()
            .collect();
        if terminal.len() > self.max_completed {
            terminal.sort_by_key(|t| t.updated_at());
            let excess = terminal.len() - self.max_completed;
            for task in terminal.into_iter().take(excess) {
                tasks.remove(&task.id);
            }
            debug!(count = excess, "evicted tasks beyond capacity");
        }
    }

    /// Background sweep on a fixed interval.
    pub fn spawn_evictor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.evict();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtask(id: &str, deps: &[&str]) -> ValidatedSubtask {
        ValidatedSubtask {
            id: id.to_string(),
            agent: "a".to_string(),
            prompt: "p".to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn finished_task(store: &TaskStore, name: &str) -> Arc<TaskRecord> {
        let task = TaskRecord::new(name, vec![subtask("s", &[])]);
        task.subtasks[0].mark_done("ok".to_string());
        task.recompute_state();
        store.insert(Arc::clone(&task));
        task
    }

    #[test]
    fn subtask_states_move_monotonically() {
        let record = SubtaskRecord::new(subtask("s", &[]));
        assert!(record.mark_running());
        assert!(!record.mark_running());
        assert!(record.mark_done("out".to_string()));
        // Terminal is terminal: no reversal, no double fire.
        assert!(!record.mark_error("nope".to_string()));
        assert!(!record.mark_cancelled());
        assert_eq!(record.state(), SubtaskState::Done);
        assert_eq!(record.result().as_deref(), Some("out"));
        assert!(record.terminal.is_cancelled());
    }

    #[test]
    fn recompute_follows_spec_order() {
        let task = TaskRecord::new("t", vec![subtask("a", &[]), subtask("b", &[])]);
        assert_eq!(task.recompute_state(), TaskState::Running);

        task.subtasks[0].mark_done("x".to_string());
        assert_eq!(task.recompute_state(), TaskState::Running);

        task.subtasks[1].mark_done("y".to_string());
        assert_eq!(task.recompute_state(), TaskState::Done);
    }

    #[test]
    fn recompute_error_when_any_error() {
        let task = TaskRecord::new("t", vec![subtask("a", &[]), subtask("b", &[])]);
        task.subtasks[0].mark_error("boom".to_string());
        task.subtasks[1].mark_done("y".to_string());
        assert_eq!(task.recompute_state(), TaskState::Error);
    }

    #[test]
    fn recompute_cancelled_when_all_cancelled() {
        let task = TaskRecord::new("t", vec![subtask("a", &[]), subtask("b", &[])]);
        task.subtasks[0].mark_cancelled();
        task.subtasks[1].mark_cancelled();
        assert_eq!(task.recompute_state(), TaskState::Cancelled);
    }

    #[test]
    fn cancelled_task_stays_cancelled() {
        let task = TaskRecord::new("t", vec![subtask("a", &[])]);
        task.set_state(TaskState::Cancelled);
        task.subtasks[0].mark_done("x".to_string());
        assert_eq!(task.recompute_state(), TaskState::Cancelled);
    }

    #[test]
    fn ttl_eviction_drops_old_terminal_tasks() {
        let store = TaskStore::new(100, Duration::from_secs(3600));
        let old = finished_task(&store, "old");
        old.backdate_for_tests(Duration::from_secs(7200));
        finished_task(&store, "fresh");

        store.evict();
        assert!(store.get(&old.id).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn capacity_eviction_drops_oldest_terminal_tasks() {
        let store = TaskStore::new(2, Duration::from_secs(3600));
        let first = finished_task(&store, "first");
        first.backdate_for_tests(Duration::from_secs(30));
        let second = finished_task(&store, "second");
        second.backdate_for_tests(Duration::from_secs(20));
        finished_task(&store, "third");

        store.evict();
        assert_eq!(store.len(), 2);
        assert!(store.get(&first.id).is_none());
    }

    #[test]
    fn running_tasks_are_never_evicted() {
        let store = TaskStore::new(1, Duration::from_millis(1));
        let running = TaskRecord::new("running", vec![subtask("s", &[])]);
        running.backdate_for_tests(Duration::from_secs(7200));
        store.insert(Arc::clone(&running));
        finished_task(&store, "done-1");
        finished_task(&store, "done-2");

        store.evict();
        assert!(store.get(&running.id).is_some());
    }
}
