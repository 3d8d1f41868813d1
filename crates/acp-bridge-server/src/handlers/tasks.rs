// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Task graph endpoints.

use crate::error::ApiResult;
use crate::state::AppState;
use acp_bridge_tasks::SubtaskSpec;
use acp_bridge_types::{BridgeError, SubtaskStatus, TaskStatus};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub name: String,
    #[serde(default)]
    pub subtasks: Vec<SubtaskSpec>,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<TaskStatus>)> {
    let status = state.scheduler.create(&request.name, &request.subtasks)?;
    Ok((StatusCode::CREATED, Json(status)))
}

pub async fn list_tasks(State(state): State<AppState>) -> Json<Vec<TaskStatus>> {
    Json(state.tasks.list().iter().map(|task| task.status()).collect())
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskStatus>> {
    let task = state
        .tasks
        .get(&id)
        .ok_or(BridgeError::TaskNotFound(id))?;
    Ok(Json(task.status()))
}

pub async fn get_subtask(
    State(state): State<AppState>,
    Path((id, subtask_id)): Path<(String, String)>,
) -> ApiResult<Json<SubtaskStatus>> {
    let task = state
        .tasks
        .get(&id)
        .ok_or_else(|| BridgeError::TaskNotFound(id.clone()))?;
    let subtask = task
        .subtask(&subtask_id)
        .ok_or(BridgeError::SubtaskNotFound {
            task: id,
            subtask: subtask_id,
        })?;
    Ok(Json(subtask.status()))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let cancelled = state.scheduler.cancel(&id).await?;
    Ok(Json(json!({ "id": id, "cancelled": cancelled })))
}
