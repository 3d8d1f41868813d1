// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Registry of live agents and the ask executor.
//!
//! The registry is the process-wide keyed store of [`AgentHandle`]s. It
//! enforces name uniqueness, runs preflight before every spawn, applies the
//! one-prompt-at-a-time rule at the state transition, and owns the
//! agent-level cancel used both by the HTTP surface and by task
//! cancellation.

use crate::permissions;
use crate::preflight;
use crate::record::AgentHandle;
use crate::supervisor::{self, AgentCommand, SpawnPlan};
use acp_bridge_types::{classify, ActiveTask, AgentState, AgentStatus, AgentType, BridgeError,
    BridgeResult};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 16;
const CANCEL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default ask deadline, overridable via `ACP_BRIDGE_ASK_TIMEOUT_MS`.
pub const DEFAULT_ASK_TIMEOUT_MS: u64 = 300_000;

/// Per-type launch overrides from the configuration file.
#[derive(Debug, Clone, Default)]
pub struct AgentOverride {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Caller-supplied spawn request.
#[derive(Debug, Clone)]
pub struct StartAgentSpec {
    pub name: String,
    pub agent_type: AgentType,
    pub cwd: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Result of a completed ask.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AskOutcome {
    pub name: String,
    pub state: AgentState,
    pub stop_reason: Option<String>,
    pub response: String,
}

/// Result of an agent-level cancel.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub cancelled_permissions: usize,
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<AgentHandle>>>,
    overrides: HashMap<String, AgentOverride>,
    ask_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(overrides: HashMap<String, AgentOverride>, ask_timeout: Duration) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            overrides,
            ask_timeout,
        }
    }

    pub fn ask_timeout(&self) -> Duration {
        self.ask_timeout
    }

    pub async fn get(&self, name: &str) -> Option<Arc<AgentHandle>> {
        self.agents.read().await.get(name).cloned()
    }

    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn statuses(&self) -> Vec<AgentStatus> {
        let mut statuses: Vec<AgentStatus> = self
            .agents
            .read()
            .await
            .values()
            .map(|handle| handle.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub async fn status(&self, name: &str) -> BridgeResult<AgentStatus> {
        self.get(name)
            .await
            .map(|handle| handle.status())
            .ok_or_else(|| BridgeError::AgentNotFound(name.to_string()))
    }

    /// Preflight, spawn, and register a new agent. The record appears in the
    /// store only after the ACP handshake completes.
    pub async fn start(&self, spec: StartAgentSpec) -> BridgeResult<AgentStatus> {
        let name = spec.name.trim().to_string();
        if name.is_empty() {
            return Err(BridgeError::Validation("agent name is required".to_string()));
        }
        if self.agents.read().await.contains_key(&name) {
            return Err(BridgeError::Validation(format!(
                "agent '{name}' already exists"
            )));
        }

        let override_cfg = self
            .overrides
            .get(spec.agent_type.as_str())
            .cloned()
            .unwrap_or_default();

        let env = preflight::merged_env(&[&override_cfg.env, &spec.env]);
        preflight::preflight(&spec.agent_type, &env)
            .await
            .map_err(BridgeError::Preflight)?;

        let cwd = match spec.cwd.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(raw) => preflight::expand_tilde(raw),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };

        let explicit_command = spec
            .command
            .clone()
            .map(|command| (command, spec.args.clone()))
            .or_else(|| {
                override_cfg
                    .command
                    .clone()
                    .map(|command| (command, override_cfg.args.clone()))
            })
            .or_else(|| {
                env.get(preflight::AGENT_COMMAND_VAR)
                    .filter(|v| !v.trim().is_empty())
                    .map(|command| (command.trim().to_string(), Vec::new()))
            });
        let candidates = supervisor::launch_candidates(&spec.agent_type, explicit_command);

        let mut child_env: Vec<(String, String)> = Vec::new();
        for (key, value) in override_cfg.env.iter().chain(spec.env.iter()) {
            child_env.push((key.clone(), value.clone()));
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = Arc::new(AgentHandle::new(
            name.clone(),
            spec.agent_type.clone(),
            cwd.clone(),
            command_tx,
        ));

        // Reserve the name before the handshake so a concurrent start with
        // the same name fails fast.
        {
            let mut agents = self.agents.write().await;
            if agents.contains_key(&name) {
                return Err(BridgeError::Validation(format!(
                    "agent '{name}' already exists"
                )));
            }
            agents.insert(name.clone(), Arc::clone(&handle));
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let plan = SpawnPlan {
            candidates,
            cwd,
            env: child_env,
        };
        let spawn_result = supervisor::spawn_worker(Arc::clone(&handle), plan, ready_tx, command_rx);

        let startup = match spawn_result {
            Err(err) => Err(format!("failed to start agent worker: {err}")),
            Ok(()) => match ready_rx.await {
                Ok(result) => result,
                Err(_) => Err("agent worker exited before handshake".to_string()),
            },
        };

        if let Err(err) = startup {
            self.agents.write().await.remove(&name);
            warn!(agent = %name, error = %err, "agent startup failed");
            return Err(BridgeError::Preflight(err));
        }

        info!(agent = %name, agent_type = %spec.agent_type, "agent started");
        Ok(handle.status())
    }

    /// Stop and deregister an agent. Pending permissions resolve as
    /// cancelled; the child receives SIGTERM.
    pub async fn stop(&self, name: &str) -> BridgeResult<()> {
        let handle = {
            let mut agents = self.agents.write().await;
            agents
                .remove(name)
                .ok_or_else(|| BridgeError::AgentNotFound(name.to_string()))?
        };
        permissions::cancel_all(&handle);
        let _ = handle.commands().send(AgentCommand::Shutdown).await;
        info!(agent = %name, "agent stopped");
        Ok(())
    }

    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.agents.read().await.keys().cloned().collect();
        for name in names {
            let _ = self.stop(&name).await;
        }
    }

    /// Execute one prompt against an agent, enforcing the one-prompt-at-a-time
    /// rule, the wall-clock deadline, and failure classification.
    pub async fn ask(
        &self,
        name: &str,
        prompt: &str,
        active_task: Option<ActiveTask>,
    ) -> BridgeResult<AskOutcome> {
        let handle = self
            .get(name)
            .await
            .ok_or_else(|| BridgeError::AgentNotFound(name.to_string()))?;

        // Claim the agent. The busy check and the transition share one
        // critical section.
        {
            let mut state = handle.lock_state();
            if state.state == AgentState::Working {
                return Err(BridgeError::AgentBusy(name.to_string()));
            }
            state.state = AgentState::Working;
            state.current_text.clear();
            state.stop_reason = None;
            state.active_task = active_task.clone();
            state.touch();
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = handle
            .commands()
            .send(AgentCommand::Prompt {
                text: prompt.to_string(),
                reply: reply_tx,
            })
            .await;
        if sent.is_err() {
            let message = classify("agent worker unavailable");
            self.finish_failure(&handle, &active_task, message.clone());
            return Err(BridgeError::AgentFailure(message));
        }

        let timeout_ms = self.ask_timeout.as_millis() as u64;
        match tokio::time::timeout(self.ask_timeout, reply_rx).await {
            Err(_) => {
                // Deadline expired; the child stays alive and the agent
                // returns to idle.
                let mut state = handle.lock_state();
                state.state = AgentState::Idle;
                state.stop_reason = Some("timeout".to_string());
                state.last_error = Some(format!("ask timeout after {timeout_ms}ms"));
                Self::clear_claim(&mut state, &active_task);
                state.touch();
                Err(BridgeError::AskTimeout(timeout_ms))
            }
            Ok(Err(_)) => {
                let message = classify("agent stopped during prompt");
                self.finish_failure(&handle, &active_task, message.clone());
                Err(BridgeError::AgentFailure(message))
            }
            Ok(Ok(Ok(stop_reason))) => {
                let response = {
                    let mut state = handle.lock_state();
                    state.state = AgentState::Idle;
                    state.stop_reason = stop_reason.clone();
                    state.last_text = state.current_text.clone();
                    Self::clear_claim(&mut state, &active_task);
                    state.touch();
                    state.last_text.clone()
                };
                Ok(AskOutcome {
                    name: name.to_string(),
                    state: AgentState::Idle,
                    stop_reason,
                    response,
                })
            }
            Ok(Ok(Err(raw))) => {
                let message = classify(&raw);
                self.finish_failure(&handle, &active_task, message.clone());
                Err(BridgeError::AgentFailure(message))
            }
        }
    }

    /// Issue an ACP cancel to the agent and drain its permission queue.
    /// Best-effort: the agent is not waited on to acknowledge.
    pub async fn cancel(&self, name: &str) -> BridgeResult<CancelOutcome> {
        let handle = self
            .get(name)
            .await
            .ok_or_else(|| BridgeError::AgentNotFound(name.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        if handle
            .commands()
            .send(AgentCommand::Cancel { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = tokio::time::timeout(CANCEL_REPLY_TIMEOUT, reply_rx).await;
        }

        let cancelled_permissions = permissions::cancel_all(&handle);
        {
            let mut state = handle.lock_state();
            if state.state == AgentState::Working {
                state.state = AgentState::Idle;
                state.touch();
            }
        }
        Ok(CancelOutcome {
            cancelled_permissions,
        })
    }

    fn finish_failure(
        &self,
        handle: &AgentHandle,
        claim: &Option<ActiveTask>,
        message: String,
    ) {
        let mut state = handle.lock_state();
        state.state = AgentState::Error;
        state.last_error = Some(message);
        Self::clear_claim(&mut state, claim);
        state.touch();
    }

    /// Clear the task marker only when it still matches the claim set by
    /// this ask, so a newer claim is never clobbered.
    fn clear_claim(state: &mut crate::record::RecordState, claim: &Option<ActiveTask>) {
        if state.active_task == *claim {
            state.active_task = None;
        }
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_tests(&self, handle: Arc<AgentHandle>) {
        self.agents
            .write()
            .await
            .insert(handle.name.clone(), handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AgentHandle;

    fn registry(ask_timeout: Duration) -> AgentRegistry {
        AgentRegistry::new(HashMap::new(), ask_timeout)
    }

    /// Handle plus a fake worker task that scripts the reply.
    fn scripted_handle<F>(name: &str, script: F) -> Arc<AgentHandle>
    where
        F: FnOnce(Arc<AgentHandle>, AgentCommand) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = Arc::new(AgentHandle::new(
            name.to_string(),
            AgentType::Opencode,
            PathBuf::from("/tmp"),
            tx,
        ));
        let worker_handle = Arc::clone(&handle);
        tokio::spawn(async move {
            if let Some(cmd) = rx.recv().await {
                script(worker_handle, cmd);
            }
        });
        handle
    }

    #[tokio::test]
    async fn ask_unknown_agent_is_not_found() {
        let registry = registry(Duration::from_secs(1));
        assert!(matches!(
            registry.ask("ghost", "hi", None).await,
            Err(BridgeError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn ask_rejects_busy_agent() {
        let registry = registry(Duration::from_secs(1));
        let handle = scripted_handle("a", |_, _| {});
        handle.lock_state().state = AgentState::Working;
        registry.insert_for_tests(Arc::clone(&handle)).await;

        assert!(matches!(
            registry.ask("a", "hi", None).await,
            Err(BridgeError::AgentBusy(_))
        ));
    }

    #[tokio::test]
    async fn successful_ask_aggregates_chunks() {
        let registry = registry(Duration::from_secs(5));
        let handle = scripted_handle("a", |handle, cmd| {
            if let AgentCommand::Prompt { reply, .. } = cmd {
                handle.publish_chunk("chunk one, ");
                handle.publish_chunk("chunk two");
                let _ = reply.send(Ok(Some("end_turn".to_string())));
            }
        });
        registry.insert_for_tests(Arc::clone(&handle)).await;

        let outcome = registry.ask("a", "go", None).await.unwrap();
        assert_eq!(outcome.response, "chunk one, chunk two");
        assert_eq!(outcome.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(outcome.state, AgentState::Idle);
        assert_eq!(handle.state(), AgentState::Idle);
        assert_eq!(handle.lock_state().last_text, "chunk one, chunk two");
    }

    #[tokio::test]
    async fn ask_clears_previous_reply_text() {
        let registry = registry(Duration::from_secs(5));
        let handle = scripted_handle("a", |handle, cmd| {
            if let AgentCommand::Prompt { reply, .. } = cmd {
                handle.publish_chunk("fresh");
                let _ = reply.send(Ok(Some("end_turn".to_string())));
            }
        });
        handle.lock_state().current_text = "stale".to_string();
        registry.insert_for_tests(Arc::clone(&handle)).await;

        let outcome = registry.ask("a", "go", None).await.unwrap();
        assert_eq!(outcome.response, "fresh");
    }

    #[tokio::test]
    async fn ask_timeout_returns_agent_to_idle() {
        let registry = registry(Duration::from_millis(50));
        // Worker that never replies.
        let handle = scripted_handle("a", |_, cmd| {
            if let AgentCommand::Prompt { reply, .. } = cmd {
                std::mem::forget(reply);
            }
        });
        registry.insert_for_tests(Arc::clone(&handle)).await;

        let err = registry.ask("a", "go", None).await.unwrap_err();
        assert!(matches!(err, BridgeError::AskTimeout(50)));

        let state = handle.lock_state();
        assert_eq!(state.state, AgentState::Idle);
        assert_eq!(state.stop_reason.as_deref(), Some("timeout"));
        assert_eq!(
            state.last_error.as_deref(),
            Some("ask timeout after 50ms")
        );
    }

    #[tokio::test]
    async fn ask_failure_is_classified_and_marks_error() {
        let registry = registry(Duration::from_secs(5));
        let handle = scripted_handle("a", |_, cmd| {
            if let AgentCommand::Prompt { reply, .. } = cmd {
                let _ = reply.send(Err("request failed with status 429".to_string()));
            }
        });
        registry.insert_for_tests(Arc::clone(&handle)).await;

        let err = registry.ask("a", "go", None).await.unwrap_err();
        match err {
            BridgeError::AgentFailure(message) => {
                assert_eq!(message, "Rate limited. Check proxy quota.");
            }
            other => panic!("expected AgentFailure, got {other:?}"),
        }
        let state = handle.lock_state();
        assert_eq!(state.state, AgentState::Error);
        assert_eq!(
            state.last_error.as_deref(),
            Some("Rate limited. Check proxy quota.")
        );
    }

    #[tokio::test]
    async fn ask_clears_matching_task_marker() {
        let registry = registry(Duration::from_secs(5));
        let handle = scripted_handle("a", |_, cmd| {
            if let AgentCommand::Prompt { reply, .. } = cmd {
                let _ = reply.send(Ok(Some("end_turn".to_string())));
            }
        });
        registry.insert_for_tests(Arc::clone(&handle)).await;

        let claim = ActiveTask {
            task_id: "t1".to_string(),
            subtask_id: "s1".to_string(),
        };
        registry.ask("a", "go", Some(claim)).await.unwrap();
        assert_eq!(handle.active_task(), None);
    }

    #[tokio::test]
    async fn ask_preserves_newer_task_marker() {
        let registry = registry(Duration::from_secs(5));
        let newer = ActiveTask {
            task_id: "t2".to_string(),
            subtask_id: "s9".to_string(),
        };
        let newer_for_worker = newer.clone();
        let handle = scripted_handle("a", move |handle, cmd| {
            if let AgentCommand::Prompt { reply, .. } = cmd {
                // A racing claim lands before this ask finishes.
                handle.lock_state().active_task = Some(newer_for_worker);
                let _ = reply.send(Ok(Some("end_turn".to_string())));
            }
        });
        registry.insert_for_tests(Arc::clone(&handle)).await;

        let claim = ActiveTask {
            task_id: "t1".to_string(),
            subtask_id: "s1".to_string(),
        };
        registry.ask("a", "go", Some(claim)).await.unwrap();
        assert_eq!(handle.active_task(), Some(newer));
    }

    #[tokio::test]
    async fn cancel_drains_permissions_and_returns_idle() {
        let registry = registry(Duration::from_secs(1));
        let handle = scripted_handle("a", |_, cmd| {
            if let AgentCommand::Cancel { reply } = cmd {
                let _ = reply.send(Ok(()));
            }
        });
        handle.lock_state().state = AgentState::Working;
        {
            let (tx, _rx) = oneshot::channel();
            handle.lock_state().pending.push_back(crate::record::PendingPermission {
                request_id: permissions::next_request_id(),
                tool_call: serde_json::Value::Null,
                options: Vec::new(),
                requested_at: chrono::Utc::now(),
                resolver: tx,
            });
        }
        registry.insert_for_tests(Arc::clone(&handle)).await;

        let outcome = registry.cancel("a").await.unwrap();
        assert_eq!(outcome.cancelled_permissions, 1);
        assert_eq!(handle.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn stop_deregisters_agent() {
        let registry = registry(Duration::from_secs(1));
        let handle = scripted_handle("a", |_, _| {});
        registry.insert_for_tests(Arc::clone(&handle)).await;

        registry.stop("a").await.unwrap();
        assert!(registry.get("a").await.is_none());
        assert!(matches!(
            registry.stop("a").await,
            Err(BridgeError::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn start_rejects_blank_name() {
        let registry = registry(Duration::from_secs(1));
        let err = registry
            .start(StartAgentSpec {
                name: "   ".to_string(),
                agent_type: AgentType::Opencode,
                cwd: None,
                command: None,
                args: Vec::new(),
                env: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));
    }
}
