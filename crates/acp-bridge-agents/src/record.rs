// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Live agent records.
//!
//! An [`AgentHandle`] is the single source of truth for one agent: lifecycle
//! state, the bounded stderr tail, accumulated reply text, the pending
//! permission queue, and the chunk fan-out. The supervisor worker mutates it
//! from its thread; HTTP handlers and the scheduler read it from anywhere.
//! Critical sections are short and never held across awaits.

use crate::supervisor::AgentCommand;
use acp_bridge_types::{
    ActiveTask, AgentState, AgentStatus, AgentType, PendingPermissionView, PermissionChoice,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, OnceLock};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Maximum retained stderr lines per agent; oldest entries are dropped.
pub const STDERR_CAP: usize = 50;

/// Buffered chunks per fan-out subscriber before lagging.
const CHUNK_CHANNEL_CAPACITY: usize = 1024;

/// Resolution delivered to a parked permission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Selected(String),
    Cancelled,
}

/// A permission request parked on the queue, holding the one-shot
/// continuation that completes the ACP call.
#[derive(Debug)]
pub struct PendingPermission {
    pub request_id: u64,
    pub tool_call: serde_json::Value,
    pub options: Vec<PermissionChoice>,
    pub requested_at: DateTime<Utc>,
    pub resolver: oneshot::Sender<PermissionDecision>,
}

impl PendingPermission {
    pub fn view(&self) -> PendingPermissionView {
        PendingPermissionView {
            request_id: self.request_id,
            tool_call: self.tool_call.clone(),
            options: self.options.clone(),
            requested_at: self.requested_at,
        }
    }
}

/// Mutable portion of an agent record.
#[derive(Debug)]
pub struct RecordState {
    pub state: AgentState,
    pub last_error: Option<String>,
    pub stderr: VecDeque<String>,
    pub last_text: String,
    pub current_text: String,
    pub stop_reason: Option<String>,
    pub pending: VecDeque<PendingPermission>,
    pub active_task: Option<ActiveTask>,
    pub process_alive: bool,
    pub updated_at: DateTime<Utc>,
}

impl RecordState {
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One live agent. Owned by the registry, shared with the supervisor worker.
pub struct AgentHandle {
    pub name: String,
    pub agent_type: AgentType,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    session_id: OnceLock<String>,
    protocol_version: OnceLock<String>,
    state: Mutex<RecordState>,
    chunks: broadcast::Sender<String>,
    commands: mpsc::Sender<AgentCommand>,
}

impl AgentHandle {
    pub fn new(
        name: String,
        agent_type: AgentType,
        cwd: PathBuf,
        commands: mpsc::Sender<AgentCommand>,
    ) -> Self {
        let (chunks, _) = broadcast::channel(CHUNK_CHANNEL_CAPACITY);
        let now = Utc::now();
        Self {
            name,
            agent_type,
            cwd,
            created_at: now,
            session_id: OnceLock::new(),
            protocol_version: OnceLock::new(),
            state: Mutex::new(RecordState {
                state: AgentState::Starting,
                last_error: None,
                stderr: VecDeque::new(),
                last_text: String::new(),
                current_text: String::new(),
                stop_reason: None,
                pending: VecDeque::new(),
                active_task: None,
                process_alive: false,
                updated_at: now,
            }),
            chunks,
            commands,
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().expect("agent record lock poisoned")
    }

    pub(crate) fn commands(&self) -> mpsc::Sender<AgentCommand> {
        self.commands.clone()
    }

    /// Session id and protocol version are set once at handshake and
    /// immutable afterwards.
    pub fn set_handshake(&self, session_id: String, protocol_version: String) {
        let _ = self.session_id.set(session_id);
        let _ = self.protocol_version.set(protocol_version);
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.get().map(String::as_str)
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.get().map(String::as_str)
    }

    pub fn state(&self) -> AgentState {
        self.lock_state().state
    }

    pub fn process_alive(&self) -> bool {
        self.lock_state().process_alive
    }

    pub fn active_task(&self) -> Option<ActiveTask> {
        self.lock_state().active_task.clone()
    }

    pub fn subscribe_chunks(&self) -> broadcast::Receiver<String> {
        self.chunks.subscribe()
    }

    /// Append a streamed chunk to the per-prompt accumulator and publish it
    /// to every subscriber. `lastText` mirrors the in-progress reply so a
    /// status read mid-prompt sees the text so far.
    pub fn publish_chunk(&self, text: &str) {
        {
            let mut state = self.lock_state();
            state.current_text.push_str(text);
            state.last_text = state.current_text.clone();
            state.touch();
        }
        let _ = self.chunks.send(text.to_string());
    }

    /// Record a trimmed non-empty stderr line; the latest one doubles as
    /// `lastError`.
    pub fn push_stderr(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let mut state = self.lock_state();
        if state.stderr.len() >= STDERR_CAP {
            state.stderr.pop_front();
        }
        state.stderr.push_back(trimmed.to_string());
        state.last_error = Some(trimmed.to_string());
        state.touch();
    }

    pub fn recent_stderr(&self) -> Vec<String> {
        self.lock_state().stderr.iter().cloned().collect()
    }

    pub fn mark_working(&self) {
        let mut state = self.lock_state();
        if state.state != AgentState::Working {
            state.state = AgentState::Working;
            state.touch();
        }
    }

    pub(crate) fn mark_started(&self) {
        let mut state = self.lock_state();
        state.process_alive = true;
        state.state = AgentState::Idle;
        state.touch();
    }

    /// Explicit stop: the child is gone, pending permissions resolve as
    /// cancelled, no synthetic exit error is recorded.
    pub(crate) fn mark_stopped(&self) {
        let drained = {
            let mut state = self.lock_state();
            let drained: Vec<PendingPermission> = state.pending.drain(..).collect();
            state.process_alive = false;
            if state.state != AgentState::Error {
                state.state = AgentState::Stopped;
            }
            state.touch();
            drained
        };
        for pending in drained {
            let _ = pending.resolver.send(PermissionDecision::Cancelled);
        }
    }

    pub fn record_error(&self, message: String) {
        let mut state = self.lock_state();
        state.last_error = Some(message);
        state.touch();
    }

    /// Child exit: every pending permission resolves as cancelled, the record
    /// goes to `stopped` unless it already holds an error, and the exit
    /// status is recorded when nothing better was.
    pub fn on_child_exit(&self, code: Option<i32>, signal: Option<i32>) {
        let drained = {
            let mut state = self.lock_state();
            let drained: Vec<PendingPermission> = state.pending.drain(..).collect();
            state.process_alive = false;
            if state.state != AgentState::Error {
                state.state = AgentState::Stopped;
            }
            if state.last_error.is_none() {
                state.last_error = Some(format!(
                    "exit code={} signal={}",
                    code.map(|c| c.to_string()).unwrap_or_else(|| "null".into()),
                    signal.map(|s| s.to_string()).unwrap_or_else(|| "null".into()),
                ));
            }
            state.touch();
            drained
        };
        for pending in drained {
            let _ = pending.resolver.send(PermissionDecision::Cancelled);
        }
    }

    pub fn status(&self) -> AgentStatus {
        let state = self.lock_state();
        AgentStatus {
            name: self.name.clone(),
            agent_type: self.agent_type.clone(),
            cwd: self.cwd.to_string_lossy().to_string(),
            state: state.state,
            session_id: self.session_id().map(str::to_string),
            protocol_version: self.protocol_version().map(str::to_string),
            last_error: state.last_error.clone(),
            stop_reason: state.stop_reason.clone(),
            last_text: state.last_text.clone(),
            pending_permissions: state.pending.iter().map(PendingPermission::view).collect(),
            active_task: state.active_task.clone(),
            created_at: self.created_at,
            updated_at: state.updated_at,
        }
    }
}
