// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! HTTP surface of the ACP bridge daemon.
//!
//! Thin request routing over the agent registry and task scheduler: JSON
//! request/response handlers, server-sent streaming for asks, and the
//! configuration loader for the `acp-bridge` binary.

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use config::BridgeConfig;
pub use error::{ApiError, ApiResult};
pub use server::build_router;
pub use state::AppState;
