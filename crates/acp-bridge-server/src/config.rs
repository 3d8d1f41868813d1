// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon configuration: built-in defaults, an optional JSON file, then
//! process environment, in that order. Loaded once at startup and treated as
//! read-only afterwards.

use acp_bridge_agents::preflight::expand_tilde;
use acp_bridge_agents::registry::{AgentOverride, DEFAULT_ASK_TIMEOUT_MS};
use acp_bridge_tasks::store::{DEFAULT_MAX_COMPLETED_TASKS, DEFAULT_TASK_TTL};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 7800;
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Shape of the JSON configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FileConfig {
    port: Option<u16>,
    host: Option<String>,
    agents: HashMap<String, FileAgentConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FileAgentConfig {
    command: Option<String>,
    args: Vec<String>,
    env: HashMap<String, String>,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub ask_timeout: Duration,
    pub max_tasks: usize,
    pub task_ttl: Duration,
    pub agents: HashMap<String, AgentOverride>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            ask_timeout: Duration::from_millis(DEFAULT_ASK_TIMEOUT_MS),
            max_tasks: DEFAULT_MAX_COMPLETED_TASKS,
            task_ttl: DEFAULT_TASK_TTL,
            agents: HashMap::new(),
        }
    }
}

impl BridgeConfig {
    /// Load the configuration: defaults, then the file (when given), then
    /// `ACP_BRIDGE_*` environment variables. A malformed file logs a
    /// structured warning and is treated as empty.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = Self::default();

        if let Some(path) = path {
            config.apply_file(path);
        }

        if let Some(host) = env_string("ACP_BRIDGE_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parsed::<u16>("ACP_BRIDGE_PORT") {
            config.port = port;
        }
        if let Some(ms) = env_parsed::<u64>("ACP_BRIDGE_ASK_TIMEOUT_MS") {
            config.ask_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = env_parsed::<usize>("ACP_BRIDGE_MAX_TASKS") {
            config.max_tasks = max;
        }
        if let Some(ms) = env_parsed::<u64>("ACP_BRIDGE_TASK_TTL_MS") {
            config.task_ttl = Duration::from_millis(ms);
        }

        config
    }

    fn apply_file(&mut self, path: &Path) {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "config file unreadable, using defaults");
                return;
            }
        };
        let file: FileConfig = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "config file malformed, using defaults");
                return;
            }
        };

        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(host) = file.host {
            self.host = host;
        }
        for (agent_type, agent) in file.agents {
            self.agents.insert(
                agent_type,
                AgentOverride {
                    command: agent
                        .command
                        .map(|command| expand_tilde(&command).to_string_lossy().to_string()),
                    args: agent.args,
                    env: agent.env,
                },
            );
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = env_string(var)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
