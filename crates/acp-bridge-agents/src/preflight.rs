// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Pre-spawn validation: binary presence, required credentials, and upstream
//! reachability. Runs immediately before every spawn; any failure surfaces
//! as HTTP 400 with the message verbatim.

use crate::probe::{self, PROBE_TIMEOUT};
use acp_bridge_types::AgentType;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Environment variable that pins the exact executable to verify instead of
/// the per-type candidate names.
pub const AGENT_COMMAND_VAR: &str = "ACP_BRIDGE_AGENT_COMMAND";

/// Binary names accepted for a type, in preference order.
pub fn binary_candidates(agent_type: &AgentType) -> Vec<String> {
    match agent_type {
        AgentType::Codex => vec!["codex-acp".to_string(), "codex".to_string()],
        AgentType::Claude => vec!["claude-agent-acp".to_string()],
        AgentType::Gemini => vec!["gemini".to_string()],
        AgentType::Opencode => vec!["opencode".to_string()],
        AgentType::Custom(name) => vec![name.clone()],
    }
}

pub fn install_hint(agent_type: &AgentType) -> &'static str {
    match agent_type {
        AgentType::Codex => "Install it with: npm install -g @openai/codex",
        AgentType::Claude => "Install it with: npm install -g @zed-industries/claude-code-acp",
        AgentType::Gemini => "Install it with: npm install -g @google/gemini-cli",
        AgentType::Opencode => "Install it with: curl -fsSL https://opencode.ai/install | bash",
        AgentType::Custom(_) => "Install it and make sure it is on PATH.",
    }
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Locate an executable. A value containing a path separator is checked by
/// filesystem existence (after tilde expansion); a bare name goes through the
/// PATH lookup.
pub fn resolve_binary(name: &str) -> Option<PathBuf> {
    let expanded = expand_tilde(name);
    if expanded.components().count() > 1 || expanded.is_absolute() {
        if expanded.exists() {
            return Some(expanded);
        }
        return None;
    }
    which::which(Path::new(name)).ok()
}

/// First candidate that resolves, or the name to blame in the error message.
pub fn resolve_any(candidates: &[String]) -> Result<PathBuf, String> {
    for candidate in candidates {
        if let Some(path) = resolve_binary(candidate) {
            return Ok(path);
        }
    }
    Err(candidates
        .first()
        .cloned()
        .unwrap_or_else(|| "agent".to_string()))
}

fn env_non_empty(env: &HashMap<String, String>, var: &str) -> bool {
    env.get(var).map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// Check the credential requirement for a type. Any one of the accepted
/// variables being non-empty satisfies it.
pub fn check_credentials(
    agent_type: &AgentType,
    env: &HashMap<String, String>,
) -> Result<(), String> {
    let vars = agent_type.credential_vars();
    if vars.is_empty() || vars.iter().any(|var| env_non_empty(env, var)) {
        return Ok(());
    }
    Err(format!(
        "{} is not set. Set it in environment or config.",
        vars[0]
    ))
}

/// Check binary presence for a type, honoring the explicit-command override.
pub fn check_binary(agent_type: &AgentType, env: &HashMap<String, String>) -> Result<(), String> {
    let candidates = match env.get(AGENT_COMMAND_VAR).filter(|v| !v.trim().is_empty()) {
        Some(command) => vec![command.trim().to_string()],
        None => binary_candidates(agent_type),
    };
    resolve_any(&candidates).map(|_| ()).map_err(|name| {
        format!(
            "{} binary not found on PATH. {}",
            name,
            install_hint(agent_type)
        )
    })
}

/// Full pre-spawn gate: binary, credentials, then endpoint probe.
///
/// The probe accepts any HTTP status as reachable; only a non-response
/// (connect failure, DNS, timeout) fails preflight.
pub async fn preflight(agent_type: &AgentType, env: &HashMap<String, String>) -> Result<(), String> {
    check_binary(agent_type, env)?;
    check_credentials(agent_type, env)?;

    if let Some(url) = agent_type.base_url(env) {
        let outcome = probe::head(&url, PROBE_TIMEOUT).await;
        if !outcome.responded {
            let code = outcome.error.as_deref().unwrap_or("unreachable");
            return Err(format!("Proxy {url} is unreachable ({code}). Check the URL."));
        }
    }

    Ok(())
}

/// Snapshot of the process environment merged with per-agent overrides.
/// Overrides win over inherited values.
pub fn merged_env(overrides: &[&HashMap<String, String>]) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for layer in overrides {
        for (key, value) in layer.iter() {
            env.insert(key.clone(), value.clone());
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_binary(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn resolve_binary_accepts_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = fake_binary(&dir, "some-agent");
        assert_eq!(resolve_binary(path.to_str().unwrap()), Some(path));
        assert_eq!(resolve_binary("/no/such/agent-binary"), None);
    }

    #[test]
    fn check_binary_honors_command_override() {
        let dir = TempDir::new().unwrap();
        let path = fake_binary(&dir, "my-agent");

        let mut env = HashMap::new();
        env.insert(
            AGENT_COMMAND_VAR.to_string(),
            path.to_string_lossy().to_string(),
        );
        assert!(check_binary(&AgentType::Claude, &env).is_ok());

        env.insert(
            AGENT_COMMAND_VAR.to_string(),
            "/definitely/not/here".to_string(),
        );
        let err = check_binary(&AgentType::Claude, &env).unwrap_err();
        assert!(err.contains("not found on PATH"), "got: {err}");
    }

    #[test]
    fn missing_binary_message_names_first_candidate() {
        // Point PATH lookups at an empty directory by using a custom type
        // that certainly does not exist.
        let env = HashMap::new();
        let agent = AgentType::Custom("acp-bridge-test-no-such-binary".to_string());
        let err = check_binary(&agent, &env).unwrap_err();
        assert!(
            err.starts_with("acp-bridge-test-no-such-binary binary not found on PATH."),
            "got: {err}"
        );
    }

    #[test]
    fn credentials_required_per_type() {
        let mut env = HashMap::new();
        let err = check_credentials(&AgentType::Claude, &env).unwrap_err();
        assert_eq!(
            err,
            "ANTHROPIC_API_KEY is not set. Set it in environment or config."
        );

        // Either variable satisfies Claude.
        env.insert("ANTHROPIC_AUTH_TOKEN".to_string(), "cr_token".to_string());
        assert!(check_credentials(&AgentType::Claude, &env).is_ok());

        // Whitespace-only values do not count.
        let mut env = HashMap::new();
        env.insert("OPENAI_API_KEY".to_string(), "   ".to_string());
        let err = check_credentials(&AgentType::Codex, &env).unwrap_err();
        assert!(err.starts_with("OPENAI_API_KEY is not set."));

        assert!(check_credentials(&AgentType::Opencode, &env).is_ok());
    }

    #[tokio::test]
    async fn preflight_fails_before_spawn_on_missing_key() {
        let dir = TempDir::new().unwrap();
        let path = fake_binary(&dir, "claude-agent-acp");

        let mut env = HashMap::new();
        env.insert(
            AGENT_COMMAND_VAR.to_string(),
            path.to_string_lossy().to_string(),
        );
        let err = preflight(&AgentType::Claude, &env).await.unwrap_err();
        assert_eq!(
            err,
            "ANTHROPIC_API_KEY is not set. Set it in environment or config."
        );
    }

    #[tokio::test]
    async fn preflight_reports_unreachable_proxy() {
        let dir = TempDir::new().unwrap();
        let path = fake_binary(&dir, "codex-acp");

        // Bind-then-drop to obtain a refusing port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut env = HashMap::new();
        env.insert(
            AGENT_COMMAND_VAR.to_string(),
            path.to_string_lossy().to_string(),
        );
        env.insert("OPENAI_API_KEY".to_string(), "sk-test".to_string());
        env.insert("OPENAI_BASE_URL".to_string(), format!("http://{addr}"));

        let err = preflight(&AgentType::Codex, &env).await.unwrap_err();
        assert!(err.starts_with(&format!("Proxy http://{addr} is unreachable (")), "got: {err}");
        assert!(err.ends_with("Check the URL."));
    }

    #[tokio::test]
    async fn preflight_skips_probe_without_base_url() {
        let dir = TempDir::new().unwrap();
        let path = fake_binary(&dir, "opencode");

        let mut env = HashMap::new();
        env.insert(
            AGENT_COMMAND_VAR.to_string(),
            path.to_string_lossy().to_string(),
        );
        assert!(preflight(&AgentType::Opencode, &env).await.is_ok());
    }
}
