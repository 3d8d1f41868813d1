// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared domain types for the ACP bridge daemon.
//!
//! Everything that crosses a crate boundary lives here: the agent type and
//! lifecycle enums, the wire DTOs served over HTTP, the error taxonomy, and
//! the pure error classifier. The heavier machinery (process supervision,
//! scheduling, HTTP) builds on top of these.

pub mod agent;
pub mod classify;
pub mod error;
pub mod task;

pub use agent::{
    ActiveTask, AgentState, AgentStatus, AgentType, PendingPermissionView, PermissionChoice,
};
pub use classify::classify;
pub use error::{BridgeError, BridgeResult};
pub use task::{SubtaskState, SubtaskStatus, TaskState, TaskStatus};
