// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared server state: the agent registry and the task scheduler.

use crate::config::BridgeConfig;
use acp_bridge_agents::AgentRegistry;
use acp_bridge_tasks::{PromptRunner, TaskScheduler, TaskStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: BridgeConfig,
    pub registry: Arc<AgentRegistry>,
    pub scheduler: Arc<TaskScheduler>,
    pub tasks: Arc<TaskStore>,
}

impl AppState {
    pub fn new(config: BridgeConfig) -> Self {
        let registry = Arc::new(AgentRegistry::new(
            config.agents.clone(),
            config.ask_timeout,
        ));
        let tasks = TaskStore::new(config.max_tasks, config.task_ttl);
        let runner: Arc<dyn PromptRunner> = Arc::clone(&registry) as Arc<dyn PromptRunner>;
        let scheduler = TaskScheduler::new(Arc::clone(&tasks), runner);
        Self {
            config,
            registry,
            scheduler,
            tasks,
        }
    }
}
