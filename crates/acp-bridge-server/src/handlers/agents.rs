// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Agent lifecycle, ask, and permission endpoints.

use crate::error::{status_for, ApiError, ApiResult};
use crate::state::AppState;
use acp_bridge_agents::registry::StartAgentSpec;
use acp_bridge_agents::{diagnose, permissions, preflight};
use acp_bridge_types::{AgentStatus, AgentType, BridgeError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentRequest {
    #[serde(rename = "type")]
    pub agent_type: Option<AgentType>,
    pub name: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

pub async fn create_agent(
    State(state): State<AppState>,
    Json(request): Json<CreateAgentRequest>,
) -> ApiResult<(StatusCode, Json<AgentStatus>)> {
    let spec = StartAgentSpec {
        name: request.name,
        agent_type: request.agent_type.unwrap_or(AgentType::Opencode),
        cwd: request.cwd,
        command: request.command,
        args: request.args,
        env: request.env,
    };
    let status = state.registry.start(spec).await?;
    Ok((StatusCode::CREATED, Json(status)))
}

pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentStatus>> {
    Json(state.registry.statuses().await)
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<AgentStatus>> {
    Ok(Json(state.registry.status(&name).await?))
}

pub async fn delete_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.registry.stop(&name).await?;
    Ok(Json(json!({ "stopped": name })))
}

pub async fn diagnose_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<diagnose::DiagnoseReport>> {
    let handle = state
        .registry
        .get(&name)
        .await
        .ok_or(BridgeError::AgentNotFound(name))?;
    let env = preflight::merged_env(&[]);
    Ok(Json(diagnose::diagnose_agent(&handle, &env).await))
}

#[derive(Debug, Deserialize)]
pub struct AskQuery {
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub prompt: String,
}

/// Synchronous ask, or `text/event-stream` when `?stream=true`.
pub async fn ask_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<AskQuery>,
    Json(request): Json<AskRequest>,
) -> Result<Response, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(BridgeError::Validation("prompt is required".to_string()).into());
    }

    if query.stream != Some(true) {
        let outcome = state.registry.ask(&name, &request.prompt, None).await?;
        return Ok(Json(outcome).into_response());
    }

    // Precondition failures surface as plain HTTP errors; once the stream
    // starts, failures travel as `error` events.
    let handle = state
        .registry
        .get(&name)
        .await
        .ok_or_else(|| BridgeError::AgentNotFound(name.clone()))?;
    if handle.state() == acp_bridge_types::AgentState::Working {
        return Err(BridgeError::AgentBusy(name).into());
    }

    // Subscribe before the ask starts so no chunk is missed.
    let mut chunks = handle.subscribe_chunks();
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);
    let registry = state.registry.clone();
    let prompt = request.prompt.clone();

    tokio::spawn(async move {
        let mut ask = Box::pin(registry.ask(&name, &prompt, None));
        let mut chunks_open = true;
        let outcome = loop {
            if !chunks_open {
                break (&mut ask).await;
            }
            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Ok(chunk) => {
                        let event = Event::default()
                            .event("chunk")
                            .data(json!({ "chunk": chunk }).to_string());
                        if tx.send(Ok(event)).await.is_err() {
                            // Client went away; let the ask finish on its own.
                            return;
                        }
                    }
                    Err(RecvError::Closed) => chunks_open = false,
                    Err(RecvError::Lagged(_)) => {}
                },
                outcome = &mut ask => break outcome,
            }
        };

        // Chunks are published before the prompt resolves; drain whatever is
        // still queued so the stream carries the full reply.
        while let Ok(chunk) = chunks.try_recv() {
            let event = Event::default()
                .event("chunk")
                .data(json!({ "chunk": chunk }).to_string());
            if tx.send(Ok(event)).await.is_err() {
                return;
            }
        }

        let event = match outcome {
            Ok(outcome) => Event::default().event("done").data(
                serde_json::to_string(&outcome).unwrap_or_else(|_| "{}".to_string()),
            ),
            Err(err) => Event::default().event("error").data(
                json!({
                    "error": err.to_string(),
                    "statusCode": status_for(&err).as_u16(),
                })
                .to_string(),
            ),
        };
        let _ = tx.send(Ok(event)).await;
    });

    let stream = ReceiverStream::new(rx);
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
        .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvePermissionRequest {
    #[serde(default)]
    pub option_id: Option<String>,
}

pub async fn approve_permission(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ResolvePermissionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let handle = state
        .registry
        .get(&name)
        .await
        .ok_or(BridgeError::AgentNotFound(name.clone()))?;
    let resolved = permissions::approve(&handle, request.option_id.as_deref())?;
    Ok(Json(json!({
        "name": name,
        "requestId": resolved.request_id,
        "optionId": resolved.option_id,
        "outcome": "selected",
    })))
}

pub async fn deny_permission(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ResolvePermissionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let handle = state
        .registry
        .get(&name)
        .await
        .ok_or(BridgeError::AgentNotFound(name.clone()))?;
    let resolved = permissions::deny(&handle, request.option_id.as_deref())?;
    Ok(Json(json!({
        "name": name,
        "requestId": resolved.request_id,
        "optionId": resolved.option_id,
        "outcome": "selected",
    })))
}

/// ACP-cancel the agent's in-flight work and drain its permission queue.
pub async fn cancel_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state.registry.cancel(&name).await?;
    Ok(Json(json!({
        "name": name,
        "cancelledPermissions": outcome.cancelled_permissions,
    })))
}
