// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Task DAG scheduler for the ACP bridge.
//!
//! A task is a directed acyclic graph of subtasks, each a single prompt
//! against a named agent. Subtasks launch concurrently, park on their
//! dependencies' terminal signals (no polling), render upstream results into
//! their prompts, and honour cascading cancellation. Finished tasks age out
//! by TTL and by a capacity cap.

pub mod graph;
pub mod scheduler;
pub mod store;
pub mod template;

pub use graph::{validate, SubtaskSpec, ValidatedSubtask};
pub use scheduler::{PromptRunner, TaskScheduler};
pub use store::{SubtaskRecord, TaskRecord, TaskStore};
