// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Task-graph states and the status DTOs served over HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Done,
    Error,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Error => "error",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskState {
    Pending,
    Running,
    Done,
    Error,
    Cancelled,
}

impl SubtaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubtaskState::Done | SubtaskState::Error | SubtaskState::Cancelled
        )
    }
}

impl fmt::Display for SubtaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SubtaskState::Pending => "pending",
            SubtaskState::Running => "running",
            SubtaskState::Done => "done",
            SubtaskState::Error => "error",
            SubtaskState::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Subtask status as embedded in task responses.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskStatus {
    pub id: String,
    pub agent: String,
    pub prompt: String,
    pub depends_on: Vec<String>,
    pub state: SubtaskState,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Task status as served by `GET /tasks/:id`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    pub subtasks: Vec<SubtaskStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());

        assert!(!SubtaskState::Pending.is_terminal());
        assert!(!SubtaskState::Running.is_terminal());
        assert!(SubtaskState::Error.is_terminal());
    }

    #[test]
    fn states_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&TaskState::Error).unwrap(), "\"error\"");
        assert_eq!(
            serde_json::to_string(&SubtaskState::Pending).unwrap(),
            "\"pending\""
        );
    }
}
