//! Status HTTP server.
//!
//! `GET /status` serves the batch snapshot; `POST /pause`, `/resume` and
//! `/cancel` drive the control handle and answer 409 when the transition is
//! refused.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::control::{BatchControl, BatchState, ControlError};
use crate::status::{collect_system_metrics, BatchSnapshot, SharedSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct StatusState {
    pub snapshot: SharedSnapshot,
    pub control: BatchControl,
}

/// Body returned by the control endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlResponse {
    pub state: BatchState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type ControlResult = Result<Json<ControlResponse>, (StatusCode, Json<ControlResponse>)>;

async fn get_status(State(state): State<StatusState>) -> Json<BatchSnapshot> {
    let mut snapshot = state.snapshot.read().await.clone();
    snapshot.state = state.control.state();
    let system = collect_system_metrics();
    snapshot.system.cpu_usage_percent = system.cpu_usage_percent;
    snapshot.system.mem_usage_percent = system.mem_usage_percent;
    Json(snapshot)
}

async fn post_pause(State(state): State<StatusState>) -> ControlResult {
    respond(&state.control, state.control.pause())
}

async fn post_resume(State(state): State<StatusState>) -> ControlResult {
    let result = state.control.resume().await;
    respond(&state.control, result)
}

async fn post_cancel(State(state): State<StatusState>) -> ControlResult {
    respond(&state.control, state.control.cancel())
}

fn respond(control: &BatchControl, result: Result<(), ControlError>) -> ControlResult {
    match result {
        Ok(()) => Ok(Json(ControlResponse {
            state: control.state(),
            error: None,
        })),
        Err(e) => Err((
            StatusCode::CONFLICT,
            Json(ControlResponse {
                state: control.state(),
                error: Some(e.to_string()),
            }),
        )),
    }
}

/// Creates the axum Router with status and control endpoints
pub fn create_status_router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/pause", post(post_pause))
        .route("/resume", post(post_resume))
        .route("/cancel", post(post_cancel))
        .with_state(state)
}

/// Runs the status HTTP server on 127.0.0.1:`port`
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if server fails to start
pub async fn run_status_server(state: StatusState, port: u16) -> Result<(), ServerError> {
    let app = create_status_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Status server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
