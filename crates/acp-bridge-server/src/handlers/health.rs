// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Health and doctor endpoints.

use crate::state::AppState;
use acp_bridge_agents::{diagnose, preflight};
use axum::extract::State;
use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub agents: usize,
    pub version: String,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        agents: state.registry.count().await,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
pub struct DoctorResponse {
    pub results: Vec<diagnose::DoctorEntry>,
}

/// Binary, credential, and endpoint checks for every known agent type.
/// Nothing is spawned.
pub async fn doctor() -> Json<DoctorResponse> {
    let env = preflight::merged_env(&[]);
    Json(DoctorResponse {
        results: diagnose::doctor(&env).await,
    })
}
