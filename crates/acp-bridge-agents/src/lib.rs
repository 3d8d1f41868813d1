// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Agent lifecycle for the ACP bridge.
//!
//! This crate owns everything between an HTTP request and a child process
//! speaking ACP over stdio: pre-spawn validation, the per-agent connection
//! supervisor, the agent record store, the inverted permission queue, the
//! ask executor, and the diagnostics composer.
//!
//! ACP connection futures are `!Send`, so each agent runs on a dedicated
//! worker thread with a current-thread runtime and a `LocalSet`; the rest of
//! the daemon talks to it through an mpsc command channel.

pub mod diagnose;
pub mod permissions;
pub mod preflight;
pub mod probe;
pub mod record;
pub mod registry;
pub mod supervisor;

pub use record::{AgentHandle, PendingPermission, PermissionDecision};
pub use registry::{AgentOverride, AgentRegistry, AskOutcome, StartAgentSpec};
