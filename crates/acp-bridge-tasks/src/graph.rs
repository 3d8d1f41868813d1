// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Subtask graph validation: id assignment, dependency sanitization, and
//! cycle detection. All failures here become HTTP 400.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};

/// Caller-supplied subtask description.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub agent: String,
    pub prompt: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A subtask that passed validation, with its final id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSubtask {
    pub id: String,
    pub agent: String,
    pub prompt: String,
    pub depends_on: Vec<String>,
}

/// Validate a task request. Ids default to `subtask-<position>` (1-based),
/// `dependsOn` may reference only sibling ids, self-edges are rejected, and
/// the induced graph must be acyclic.
pub fn validate(name: &str, specs: &[SubtaskSpec]) -> Result<Vec<ValidatedSubtask>, String> {
    if name.trim().is_empty() {
        return Err("task name is required".to_string());
    }
    if specs.is_empty() {
        return Err("at least one subtask is required".to_string());
    }

    let mut seen = HashSet::new();
    let mut validated = Vec::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        let id = match spec.id.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            Some(id) => id.to_string(),
            None => format!("subtask-{}", index + 1),
        };
        if !seen.insert(id.clone()) {
            return Err(format!("duplicate subtask id '{id}'"));
        }
        if spec.agent.trim().is_empty() {
            return Err(format!("subtask '{id}' requires an agent"));
        }
        if spec.prompt.trim().is_empty() {
            return Err(format!("subtask '{id}' requires a prompt"));
        }
        let depends_on: Vec<String> = spec
            .depends_on
            .iter()
            .map(|dep| dep.trim().to_string())
            .filter(|dep| !dep.is_empty())
            .collect();
        validated.push(ValidatedSubtask {
            id,
            agent: spec.agent.trim().to_string(),
            prompt: spec.prompt.clone(),
            depends_on,
        });
    }

    for subtask in &validated {
        for dep in &subtask.depends_on {
            if *dep == subtask.id {
                return Err(format!("subtask '{}' cannot depend on itself", subtask.id));
            }
            if !seen.contains(dep) {
                return Err(format!(
                    "subtask '{}' depends on unknown subtask '{dep}'",
                    subtask.id
                ));
            }
        }
    }

    detect_cycle(&validated)?;
    Ok(validated)
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first cycle detection over the dependency edges.
fn detect_cycle(subtasks: &[ValidatedSubtask]) -> Result<(), String> {
    let deps: HashMap<&str, &[String]> = subtasks
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.as_slice()))
        .collect();
    let mut marks: HashMap<&str, Mark> = subtasks
        .iter()
        .map(|s| (s.id.as_str(), Mark::Unvisited))
        .collect();

    fn visit<'a>(
        id: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> bool {
        match marks.get(id).copied().unwrap_or(Mark::Done) {
            Mark::Done => return true,
            Mark::InProgress => return false,
            Mark::Unvisited => {}
        }
        marks.insert(id, Mark::InProgress);
        if let Some(edges) = deps.get(id) {
            for dep in edges.iter() {
                if !visit(dep.as_str(), deps, marks) {
                    return false;
                }
            }
        }
        marks.insert(id, Mark::Done);
        true
    }

    for subtask in subtasks {
        if !visit(subtask.id.as_str(), &deps, &mut marks) {
            return Err("subtask dependency cycle detected".to_string());
        }
    }
    Ok(())
}
