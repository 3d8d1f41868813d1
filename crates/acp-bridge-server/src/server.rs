// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Router assembly.

use crate::handlers;
use crate::state::AppState;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the bridge's HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/doctor", get(handlers::health::doctor))
        .route("/agents", post(handlers::agents::create_agent))
        .route("/agents", get(handlers::agents::list_agents))
        .route("/agents/:name", get(handlers::agents::get_agent))
        .route("/agents/:name", delete(handlers::agents::delete_agent))
        .route(
            "/agents/:name/diagnose",
            get(handlers::agents::diagnose_agent),
        )
        .route("/agents/:name/ask", post(handlers::agents::ask_agent))
        .route(
            "/agents/:name/approve",
            post(handlers::agents::approve_permission),
        )
        .route(
            "/agents/:name/deny",
            post(handlers::agents::deny_permission),
        )
        .route("/agents/:name/cancel", post(handlers::agents::cancel_agent))
        .route("/tasks", post(handlers::tasks::create_task))
        .route("/tasks", get(handlers::tasks::list_tasks))
        .route("/tasks/:id", get(handlers::tasks::get_task))
        .route("/tasks/:id", delete(handlers::tasks::cancel_task))
        .route(
            "/tasks/:id/subtasks/:subtaskId",
            get(handlers::tasks::get_subtask),
        )
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
