// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Agent identity, lifecycle state, and the status DTOs served over HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Kind of coding agent fronted by the bridge.
///
/// The four well-known kinds carry launch defaults, credential rules, and
/// endpoint URLs; anything else falls through to [`AgentType::Custom`] and is
/// launched as `<name>` with no credential requirements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AgentType {
    Opencode,
    Codex,
    Claude,
    Gemini,
    Custom(String),
}

impl AgentType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "opencode" => AgentType::Opencode,
            "codex" => AgentType::Codex,
            "claude" => AgentType::Claude,
            "gemini" => AgentType::Gemini,
            other => AgentType::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AgentType::Opencode => "opencode",
            AgentType::Codex => "codex",
            AgentType::Claude => "claude",
            AgentType::Gemini => "gemini",
            AgentType::Custom(name) => name,
        }
    }

    /// Environment variables that may satisfy the credential requirement.
    /// Any one of them being non-empty is sufficient; the first name is the
    /// one quoted in failure messages.
    pub fn credential_vars(&self) -> &'static [&'static str] {
        match self {
            AgentType::Codex => &["OPENAI_API_KEY"],
            AgentType::Claude => &["ANTHROPIC_API_KEY", "ANTHROPIC_AUTH_TOKEN"],
            AgentType::Gemini => &["GEMINI_API_KEY"],
            AgentType::Opencode | AgentType::Custom(_) => &[],
        }
    }

    /// Environment variable that overrides the probe target for this type.
    pub fn base_url_var(&self) -> Option<&'static str> {
        match self {
            AgentType::Codex => Some("OPENAI_BASE_URL"),
            AgentType::Claude => Some("ANTHROPIC_BASE_URL"),
            AgentType::Gemini => Some("GOOGLE_GEMINI_BASE_URL"),
            AgentType::Opencode | AgentType::Custom(_) => None,
        }
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            AgentType::Codex => Some("https://api.openai.com/v1"),
            AgentType::Claude => Some("https://api.anthropic.com"),
            AgentType::Gemini => Some("https://generativelanguage.googleapis.com"),
            AgentType::Opencode | AgentType::Custom(_) => None,
        }
    }

    /// Probe target: env override when set, otherwise the built-in default.
    pub fn base_url(&self, env: &HashMap<String, String>) -> Option<String> {
        if let Some(var) = self.base_url_var() {
            if let Some(url) = env.get(var).map(|v| v.trim()).filter(|v| !v.is_empty()) {
                return Some(url.to_string());
            }
        }
        self.default_base_url().map(|url| url.to_string())
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AgentType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AgentType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(AgentType::parse(&raw))
    }
}

/// Lifecycle state of a live agent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Starting,
    Idle,
    Working,
    Stopped,
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentState::Starting => "starting",
            AgentState::Idle => "idle",
            AgentState::Working => "working",
            AgentState::Stopped => "stopped",
            AgentState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Marker set on an agent while a task-driven ask is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTask {
    pub task_id: String,
    pub subtask_id: String,
}

/// One advertised option of a pending permission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionChoice {
    pub option_id: String,
    pub name: String,
    /// Stable kind label: `allow_once`, `allow_always`, `reject_once`,
    /// `reject_always`, or `other`.
    pub kind: String,
}

/// Read-only snapshot of a queued permission request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermissionView {
    pub request_id: u64,
    pub tool_call: serde_json::Value,
    pub options: Vec<PermissionChoice>,
    pub requested_at: DateTime<Utc>,
}

/// Full agent status as served by `GET /agents/:name`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub cwd: String,
    pub state: AgentState,
    pub session_id: Option<String>,
    pub protocol_version: Option<String>,
    pub last_error: Option<String>,
    pub stop_reason: Option<String>,
    pub last_text: String,
    pub pending_permissions: Vec<PendingPermissionView>,
    pub active_task: Option<ActiveTask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
