// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-agent ACP connection supervisor.
//!
//! ACP connection futures are `!Send`, so each agent gets a dedicated worker
//! thread running a current-thread runtime with a `LocalSet`. The worker
//! spawns the child with piped stdio, drives the handshake, fans inbound
//! session updates into the agent record, parks permission requests on the
//! queue, and serves prompt/cancel/shutdown commands from the registry.

use crate::permissions;
use crate::record::{AgentHandle, PendingPermission, PermissionDecision};
use acp_bridge_types::{AgentType, PermissionChoice};
use agent_client_protocol::{self as acp, Agent as _, Client};
use chrono::Utc;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Commands served by an agent worker.
#[derive(Debug)]
pub enum AgentCommand {
    Prompt {
        text: String,
        /// Resolves with the prompt's stop reason, or an error message.
        reply: oneshot::Sender<Result<Option<String>, String>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<(), String>>,
    },
    Shutdown,
}

/// One spawn attempt: a binary plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Everything the worker needs to bring an agent up.
#[derive(Debug, Clone)]
pub struct SpawnPlan {
    pub candidates: Vec<LaunchSpec>,
    pub cwd: std::path::PathBuf,
    pub env: Vec<(String, String)>,
}

/// Launch commands tried in order when no explicit override exists.
pub fn launch_candidates(
    agent_type: &AgentType,
    override_cmd: Option<(String, Vec<String>)>,
) -> Vec<LaunchSpec> {
    if let Some((command, args)) = override_cmd {
        return vec![LaunchSpec { command, args }];
    }
    match agent_type {
        AgentType::Codex => vec![
            LaunchSpec::new("codex-acp", &[]),
            LaunchSpec::new("codex", &["mcp-server"]),
        ],
        AgentType::Claude => vec![LaunchSpec::new("claude-agent-acp", &[])],
        AgentType::Gemini => vec![LaunchSpec::new("gemini", &["--experimental-acp"])],
        AgentType::Opencode => vec![LaunchSpec::new("opencode", &["acp"])],
        AgentType::Custom(name) => vec![LaunchSpec {
            command: name.clone(),
            args: Vec::new(),
        }],
    }
}

/// Child `PATH`: the OpenCode install directory prepended to the daemon's
/// own `PATH`, so default commands resolve even under a restricted shell.
pub fn child_path() -> String {
    let sep = if cfg!(windows) { ";" } else { ":" };
    let mut parts: Vec<String> = Vec::new();
    if let Some(home) = dirs::home_dir() {
        parts.push(home.join(".opencode").join("bin").to_string_lossy().to_string());
    }
    match std::env::var("PATH") {
        Ok(path) if !path.is_empty() => parts.push(path),
        _ => {}
    }
    parts.join(sep)
}

/// Spawn the worker thread for one agent. The startup outcome arrives on
/// `ready_tx` once a candidate's handshake completes (or they all fail).
pub fn spawn_worker(
    handle: Arc<AgentHandle>,
    plan: SpawnPlan,
    ready_tx: oneshot::Sender<Result<(), String>>,
    command_rx: mpsc::Receiver<AgentCommand>,
) -> std::io::Result<()> {
    let thread_name = format!("agent-{}", handle.name);
    std::thread::Builder::new().name(thread_name).spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(err) => {
                let _ = ready_tx.send(Err(format!("failed to build agent runtime: {err}")));
                return;
            }
        };
        let local = tokio::task::LocalSet::new();
        local.block_on(&rt, run_worker(handle, plan, ready_tx, command_rx));
    })?;
    Ok(())
}

struct Launched {
    child: Child,
    conn: acp::ClientSideConnection,
    session_id: acp::SessionId,
    protocol_version: String,
    mismatch: Option<String>,
}

async fn run_worker(
    handle: Arc<AgentHandle>,
    plan: SpawnPlan,
    ready_tx: oneshot::Sender<Result<(), String>>,
    command_rx: mpsc::Receiver<AgentCommand>,
) {
    let mut last_error = String::from("no launch command available");
    let mut launched = None;
    for candidate in &plan.candidates {
        match launch_candidate(&handle, &plan, candidate).await {
            Ok(ok) => {
                launched = Some(ok);
                break;
            }
            Err(err) => {
                warn!(
                    agent = %handle.name,
                    command = %candidate.command,
                    error = %err,
                    "launch candidate failed"
                );
                handle.record_error(err.clone());
                last_error = err;
            }
        }
    }

    let Some(launched) = launched else {
        let _ = ready_tx.send(Err(last_error));
        return;
    };

    handle.set_handshake(
        launched.session_id.to_string(),
        launched.protocol_version.clone(),
    );
    if let Some(version) = &launched.mismatch {
        handle.record_error(format!("protocol mismatch: {version}"));
    }
    handle.mark_started();
    info!(
        agent = %handle.name,
        session_id = %launched.session_id,
        protocol_version = %launched.protocol_version,
        "agent ready"
    );
    let _ = ready_tx.send(Ok(()));

    command_loop(handle, launched, command_rx).await;
}

async fn launch_candidate(
    handle: &Arc<AgentHandle>,
    plan: &SpawnPlan,
    candidate: &LaunchSpec,
) -> Result<Launched, String> {
    info!(
        agent = %handle.name,
        command = %candidate.command,
        args = ?candidate.args,
        cwd = %plan.cwd.display(),
        "spawning agent process"
    );

    let mut cmd = Command::new(&candidate.command);
    cmd.args(&candidate.args)
        .current_dir(&plan.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env("PATH", child_path());
    for (key, value) in &plan.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|err| {
        format!(
            "Failed to spawn {} {:?}: {err}",
            candidate.command, candidate.args
        )
    })?;

    let stdin = child.stdin.take().ok_or("failed to take child stdin")?;
    let stdout = child.stdout.take().ok_or("failed to take child stdout")?;
    let stderr = child.stderr.take().ok_or("failed to take child stderr")?;

    let stderr_handle = Arc::clone(handle);
    tokio::task::spawn_local(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(agent = %stderr_handle.name, "agent stderr: {line}");
            stderr_handle.push_stderr(&line);
        }
    });

    let delegate = BridgeClient {
        handle: Arc::clone(handle),
    };
    let (conn, io_task) = acp::ClientSideConnection::new(
        delegate,
        stdin.compat_write(),
        stdout.compat(),
        |fut| {
            tokio::task::spawn_local(fut);
        },
    );
    tokio::task::spawn_local(async move {
        let _ = io_task.await;
    });

    let init_req = acp::InitializeRequest::new(acp::ProtocolVersion::LATEST)
        .client_info(acp::Implementation::new(
            "acp-bridge",
            env!("CARGO_PKG_VERSION"),
        ))
        .client_capabilities(acp::ClientCapabilities::default());
    let new_session_req = acp::NewSessionRequest::new(plan.cwd.clone());

    // initialize and session/new are pipelined; a dead child fails both.
    let handshake = async {
        tokio::try_join!(conn.initialize(init_req), conn.new_session(new_session_req))
    };

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
        Err(_) => {
            let _ = child.start_kill();
            Err(format!(
                "agent handshake timed out after {}s",
                HANDSHAKE_TIMEOUT.as_secs()
            ))
        }
        Ok(Err(err)) => {
            let detail = handshake_failure(handle, &mut child, &err.to_string());
            let _ = child.start_kill();
            Err(detail)
        }
        Ok(Ok((init_resp, session_resp))) => {
            let protocol_version = protocol_version_label(&init_resp.protocol_version);
            let accepted = init_resp.protocol_version == acp::ProtocolVersion::LATEST
                || init_resp.protocol_version == acp::ProtocolVersion::V1;
            let mismatch = (!accepted).then(|| protocol_version.clone());
            Ok(Launched {
                child,
                conn,
                session_id: session_resp.session_id,
                protocol_version,
                mismatch,
            })
        }
    }
}

/// Fold the exit status and a stderr tail into a handshake error message.
fn handshake_failure(handle: &AgentHandle, child: &mut Child, err: &str) -> String {
    let mut message = format!("agent handshake failed: {err}");
    if let Ok(Some(status)) = child.try_wait() {
        message.push_str(&format!("; agent exited with {status}"));
    }
    let tail = handle.recent_stderr();
    if !tail.is_empty() {
        let start = tail.len().saturating_sub(10);
        message.push_str("; stderr: ");
        message.push_str(&tail[start..].join(" | "));
    }
    message
}

enum WorkerEvent {
    Exited(std::io::Result<std::process::ExitStatus>),
    Command(Option<AgentCommand>),
}

async fn command_loop(
    handle: Arc<AgentHandle>,
    launched: Launched,
    mut command_rx: mpsc::Receiver<AgentCommand>,
) {
    let Launched {
        mut child,
        conn,
        session_id,
        ..
    } = launched;

    loop {
        let event = tokio::select! {
            status = child.wait() => WorkerEvent::Exited(status),
            cmd = command_rx.recv() => WorkerEvent::Command(cmd),
        };

        match event {
            WorkerEvent::Exited(status) => {
                let (code, signal) = exit_parts(status);
                warn!(agent = %handle.name, ?code, ?signal, "agent process exited");
                handle.on_child_exit(code, signal);
                command_rx.close();
                while let Ok(cmd) = command_rx.try_recv() {
                    reject_command(cmd, "agent stopped");
                }
                return;
            }
            WorkerEvent::Command(Some(AgentCommand::Prompt { text, reply })) => {
                let (outcome, shutdown) =
                    run_prompt(&conn, &session_id, text, &mut command_rx).await;
                let _ = reply.send(outcome);
                if shutdown {
                    shutdown_child(&handle, &mut child).await;
                    return;
                }
            }
            WorkerEvent::Command(Some(AgentCommand::Cancel { reply })) => {
                let result = conn
                    .cancel(acp::CancelNotification::new(session_id.clone()))
                    .await
                    .map_err(|err| err.to_string());
                let _ = reply.send(result);
            }
            WorkerEvent::Command(Some(AgentCommand::Shutdown)) | WorkerEvent::Command(None) => {
                shutdown_child(&handle, &mut child).await;
                return;
            }
        }
    }
}

/// Drive one prompt while staying responsive to cancel and shutdown.
/// Returns the prompt outcome and whether a shutdown was requested mid-way.
async fn run_prompt(
    conn: &acp::ClientSideConnection,
    session_id: &acp::SessionId,
    text: String,
    command_rx: &mut mpsc::Receiver<AgentCommand>,
) -> (Result<Option<String>, String>, bool) {
    let request = acp::PromptRequest::new(
        session_id.clone(),
        vec![acp::ContentBlock::Text(acp::TextContent::new(text))],
    );
    let mut prompt_fut = std::pin::pin!(conn.prompt(request));

    loop {
        tokio::select! {
            result = &mut prompt_fut => {
                let outcome = result
                    .map(|resp| Some(stop_reason_label(&resp.stop_reason).to_string()))
                    .map_err(|err| err.to_string());
                return (outcome, false);
            }
            cmd = command_rx.recv() => match cmd {
                Some(AgentCommand::Cancel { reply }) => {
                    let result = conn
                        .cancel(acp::CancelNotification::new(session_id.clone()))
                        .await
                        .map_err(|err| err.to_string());
                    let _ = reply.send(result);
                }
                Some(AgentCommand::Prompt { reply, .. }) => {
                    // The registry already rejects overlapping asks; this is
                    // the worker-side backstop.
                    let _ = reply.send(Err("agent is busy".to_string()));
                }
                Some(AgentCommand::Shutdown) | None => {
                    return (Err("agent stopped".to_string()), true);
                }
            }
        }
    }
}

fn reject_command(cmd: AgentCommand, reason: &str) {
    match cmd {
        AgentCommand::Prompt { reply, .. } => {
            let _ = reply.send(Err(reason.to_string()));
        }
        AgentCommand::Cancel { reply } => {
            let _ = reply.send(Err(reason.to_string()));
        }
        AgentCommand::Shutdown => {}
    }
}

/// SIGTERM first, hard kill after a short grace period.
async fn shutdown_child(handle: &AgentHandle, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_ok() {
            handle.mark_stopped();
            return;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
    handle.mark_stopped();
}

fn exit_parts(status: std::io::Result<std::process::ExitStatus>) -> (Option<i32>, Option<i32>) {
    match status {
        Ok(status) => {
            let code = status.code();
            #[cfg(unix)]
            let signal = {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            };
            #[cfg(not(unix))]
            let signal = None;
            (code, signal)
        }
        Err(_) => (None, None),
    }
}

pub(crate) fn stop_reason_label(reason: &acp::StopReason) -> &'static str {
    match reason {
        acp::StopReason::EndTurn => "end_turn",
        acp::StopReason::MaxTokens => "max_tokens",
        acp::StopReason::MaxTurnRequests => "max_turn_requests",
        acp::StopReason::Refusal => "refusal",
        acp::StopReason::Cancelled => "cancelled",
        _ => "unknown",
    }
}

fn protocol_version_label(version: &acp::ProtocolVersion) -> String {
    match serde_json::to_value(version) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(value) => value.to_string(),
        Err(_) => "unknown".to_string(),
    }
}

fn kind_label(kind: &acp::PermissionOptionKind) -> &'static str {
    match kind {
        acp::PermissionOptionKind::AllowOnce => "allow_once",
        acp::PermissionOptionKind::AllowAlways => "allow_always",
        acp::PermissionOptionKind::RejectOnce => "reject_once",
        acp::PermissionOptionKind::RejectAlways => "reject_always",
        _ => "other",
    }
}

/// Client-side delegate: fans session updates into the record and parks
/// permission requests on the queue until an HTTP caller resolves them.
struct BridgeClient {
    handle: Arc<AgentHandle>,
}

#[async_trait::async_trait(?Send)]
impl Client for BridgeClient {
    async fn request_permission(
        &self,
        args: acp::RequestPermissionRequest,
    ) -> acp::Result<acp::RequestPermissionResponse> {
        let request_id = permissions::next_request_id();
        let options: Vec<PermissionChoice> = args
            .options
            .iter()
            .map(|opt| PermissionChoice {
                option_id: opt.option_id.to_string(),
                name: opt.name.clone(),
                kind: kind_label(&opt.kind).to_string(),
            })
            .collect();

        let (resolver, decision_rx) = oneshot::channel();
        {
            let mut state = self.handle.lock_state();
            state.pending.push_back(PendingPermission {
                request_id,
                tool_call: serde_json::to_value(&args.tool_call)
                    .unwrap_or(serde_json::Value::Null),
                options,
                requested_at: Utc::now(),
                resolver,
            });
            state.state = acp_bridge_types::AgentState::Working;
            state.touch();
        }
        info!(
            agent = %self.handle.name,
            request_id,
            "permission request parked, awaiting resolution"
        );

        // A dropped resolver (agent stopped, queue drained) means cancelled.
        let decision = decision_rx.await.unwrap_or(PermissionDecision::Cancelled);
        let outcome = match decision {
            PermissionDecision::Selected(option_id) => {
                info!(agent = %self.handle.name, request_id, option_id = %option_id, "permission resolved");
                acp::RequestPermissionOutcome::Selected(acp::SelectedPermissionOutcome::new(
                    acp::PermissionOptionId::new(option_id),
                ))
            }
            PermissionDecision::Cancelled => {
                info!(agent = %self.handle.name, request_id, "permission cancelled");
                acp::RequestPermissionOutcome::Cancelled
            }
        };
        Ok(acp::RequestPermissionResponse::new(outcome))
    }

    async fn session_notification(&self, args: acp::SessionNotification) -> acp::Result<()> {
        match args.update {
            acp::SessionUpdate::AgentMessageChunk(chunk) => {
                if let acp::ContentBlock::Text(text) = chunk.content {
                    self.handle.publish_chunk(&text.text);
                }
            }
            acp::SessionUpdate::ToolCall(_) => {
                self.handle.mark_working();
            }
            _ => {}
        }
        Ok(())
    }
}
