// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! HTTP error mapping: every [`BridgeError`] becomes `{"error": <message>}`
//! with the status code of its failure class.

use acp_bridge_types::BridgeError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError(pub BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::AgentNotFound(_)
        | BridgeError::TaskNotFound(_)
        | BridgeError::SubtaskNotFound { .. } => StatusCode::NOT_FOUND,
        BridgeError::AgentBusy(_) | BridgeError::NoPendingPermissions => StatusCode::CONFLICT,
        BridgeError::AskTimeout(_) => StatusCode::REQUEST_TIMEOUT,
        BridgeError::Preflight(_) | BridgeError::Validation(_) => StatusCode::BAD_REQUEST,
        BridgeError::AgentFailure(_) | BridgeError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
