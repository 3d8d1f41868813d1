// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bridge-wide error taxonomy.
//!
//! Every failure that reaches an HTTP caller is one of these variants; the
//! server crate maps them onto status codes (400 validation/preflight,
//! 404 missing, 408 timeout, 409 conflict, 500 agent/internal).

/// Result alias used across the bridge crates.
pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("agent '{0}' is busy")]
    AgentBusy(String),

    #[error("no_pending_permissions")]
    NoPendingPermissions,

    #[error("ask timeout after {0}ms")]
    AskTimeout(u64),

    /// Pre-spawn validation failure; the message is surfaced verbatim.
    #[error("{0}")]
    Preflight(String),

    #[error("{0}")]
    Validation(String),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("subtask '{subtask}' not found in task '{task}'")]
    SubtaskNotFound { task: String, subtask: String },

    /// Classified upstream failure returned by an agent.
    #[error("{0}")]
    AgentFailure(String),

    #[error("{0}")]
    Internal(String),
}
