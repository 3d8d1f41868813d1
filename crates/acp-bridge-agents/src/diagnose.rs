// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Diagnostics: the `/doctor` sweep over known agent types and the per-agent
//! deep report. Neither spawns anything; endpoint checks are fresh probes.

use crate::preflight::{self, AGENT_COMMAND_VAR};
use crate::probe::{self, PROBE_TIMEOUT};
use crate::record::AgentHandle;
use acp_bridge_types::{AgentState, AgentType};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DoctorLevel {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryCheck {
    pub found: bool,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyCheck {
    pub required: bool,
    pub set: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCheck {
    pub url: Option<String>,
    pub reachable: Option<bool>,
    pub status: Option<u16>,
    pub latency_ms: Option<u64>,
}

/// One row of the `/doctor` report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorEntry {
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub status: DoctorLevel,
    pub binary: BinaryCheck,
    pub api_key: ApiKeyCheck,
    pub endpoint: EndpointCheck,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Deep health report for one live agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseReport {
    pub agent: String,
    pub process_alive: bool,
    pub state: AgentState,
    pub recent_stderr: Vec<String>,
    pub last_error: Option<String>,
    pub checks: DiagnoseChecks,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseChecks {
    pub api_key_set: bool,
    pub api_key_format: &'static str,
    pub endpoint_reachable: Option<bool>,
    pub endpoint_latency_ms: Option<u64>,
    pub protocol_version: Option<String>,
}

fn env_value<'a>(env: &'a HashMap<String, String>, var: &str) -> Option<&'a str> {
    env.get(var).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn any_credential_set(agent_type: &AgentType, env: &HashMap<String, String>) -> bool {
    agent_type
        .credential_vars()
        .iter()
        .any(|var| env_value(env, var).is_some())
}

/// Classify the API key format by its well-known prefix.
pub fn api_key_format(agent_type: &AgentType, env: &HashMap<String, String>) -> &'static str {
    match agent_type {
        AgentType::Codex => match env_value(env, "OPENAI_API_KEY") {
            None => "missing",
            Some(key) if key.starts_with("sk-") => "valid",
            Some(_) => "invalid",
        },
        AgentType::Claude => match env_value(env, "ANTHROPIC_API_KEY") {
            Some(key) if key.starts_with("cr_") || key.starts_with("sk-ant-") => "valid",
            Some(_) => "invalid",
            // Token auth carries no key to format-check.
            None if env_value(env, "ANTHROPIC_AUTH_TOKEN").is_some() => "unknown",
            None => "missing",
        },
        AgentType::Gemini => match env_value(env, "GEMINI_API_KEY") {
            None => "missing",
            Some(key) if key.starts_with("AIza") => "valid",
            Some(_) => "invalid",
        },
        AgentType::Opencode | AgentType::Custom(_) => "not_required",
    }
}

fn binary_check(agent_type: &AgentType, env: &HashMap<String, String>) -> BinaryCheck {
    let candidates = match env_value(env, AGENT_COMMAND_VAR) {
        Some(command) => vec![command.to_string()],
        None => preflight::binary_candidates(agent_type),
    };
    match preflight::resolve_any(&candidates) {
        Ok(path) => BinaryCheck {
            found: true,
            path: Some(path.to_string_lossy().to_string()),
        },
        Err(_) => BinaryCheck {
            found: false,
            path: None,
        },
    }
}

async fn endpoint_check(agent_type: &AgentType, env: &HashMap<String, String>) -> EndpointCheck {
    match agent_type.base_url(env) {
        Some(url) => {
            let outcome = probe::head(&url, PROBE_TIMEOUT).await;
            EndpointCheck {
                url: Some(url),
                reachable: Some(outcome.healthy()),
                status: outcome.status,
                latency_ms: outcome.latency_ms,
            }
        }
        None => EndpointCheck {
            url: None,
            reachable: None,
            status: None,
            latency_ms: None,
        },
    }
}

async fn doctor_entry(agent_type: AgentType, env: &HashMap<String, String>) -> DoctorEntry {
    let binary = binary_check(&agent_type, env);
    let required = !agent_type.credential_vars().is_empty();
    let set = any_credential_set(&agent_type, env);
    let endpoint = endpoint_check(&agent_type, env).await;

    let mut message = None;
    let status = if !binary.found {
        message = Some(format!(
            "{} binary not found on PATH. {}",
            preflight::binary_candidates(&agent_type)
                .first()
                .cloned()
                .unwrap_or_default(),
            preflight::install_hint(&agent_type)
        ));
        DoctorLevel::Error
    } else if required && !set {
        message = Some(format!(
            "{} is not set. Set it in environment or config.",
            agent_type.credential_vars()[0]
        ));
        DoctorLevel::Error
    } else if endpoint.url.is_some() && endpoint.reachable != Some(true) {
        message = Some(match endpoint.status {
            Some(status) => format!(
                "endpoint {} answered with status {status}",
                endpoint.url.as_deref().unwrap_or_default()
            ),
            None => format!(
                "endpoint {} did not respond",
                endpoint.url.as_deref().unwrap_or_default()
            ),
        });
        DoctorLevel::Warning
    } else {
        DoctorLevel::Ok
    };

    DoctorEntry {
        agent_type,
        status,
        binary,
        api_key: ApiKeyCheck { required, set },
        endpoint,
        message,
    }
}

/// Run binary, credential, and endpoint checks for every known agent type.
pub async fn doctor(env: &HashMap<String, String>) -> Vec<DoctorEntry> {
    let mut entries = Vec::with_capacity(4);
    for agent_type in [
        AgentType::Codex,
        AgentType::Claude,
        AgentType::Gemini,
        AgentType::Opencode,
    ] {
        entries.push(doctor_entry(agent_type, env).await);
    }
    entries
}

/// Deep report for a live agent: record snapshot plus fresh checks.
pub async fn diagnose_agent(handle: &AgentHandle, env: &HashMap<String, String>) -> DiagnoseReport {
    let endpoint = endpoint_check(&handle.agent_type, env).await;
    let status = handle.status();
    DiagnoseReport {
        agent: handle.name.clone(),
        process_alive: handle.process_alive(),
        state: status.state,
        recent_stderr: handle.recent_stderr(),
        last_error: status.last_error,
        checks: DiagnoseChecks {
            api_key_set: any_credential_set(&handle.agent_type, env),
            api_key_format: api_key_format(&handle.agent_type, env),
            endpoint_reachable: endpoint.reachable,
            endpoint_latency_ms: endpoint.latency_ms,
            protocol_version: status.protocol_version,
        },
    }
}
