//! Agent HTTP API
//!
//! Fixed routes the orchestrator calls: start a step, cancel it and check
//! the agent is alive.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use keel_core::dto::job::ExecutionRequest;

use crate::scheduler::{JobQueue, SubmitError};
use crate::service::{CancelRegistry, Executor};

#[derive(Clone)]
pub struct AgentState {
    pub queue: JobQueue,
    pub cancels: CancelRegistry,
    pub executor: Executor,
}

/// API error type
#[derive(Debug)]
pub enum ApiError {
    Conflict(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Duplicate(_) => ApiError::Conflict(err.to_string()),
            SubmitError::Full | SubmitError::Stopped => ApiError::Unavailable(err.to_string()),
        }
    }
}

pub fn create_router(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/start_job", post(start_job))
        .route("/cancel_job/{job_runner_id}", post(cancel_job))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// GET /health
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// POST /start_job
async fn start_job(
    State(state): State<AgentState>,
    Json(req): Json<ExecutionRequest>,
) -> Result<StatusCode, ApiError> {
    tracing::info!(
        "Start request for job runner {} (job {})",
        req.job_runner.id,
        req.job.id
    );

    state.queue.submit(req)?;
    Ok(StatusCode::OK)
}

/// POST /cancel_job/{job_runner_id}
///
/// Canceling a step this agent no longer holds is a no-op.
async fn cancel_job(
    State(state): State<AgentState>,
    Path(job_runner_id): Path<i64>,
) -> StatusCode {
    tracing::info!("Cancel request for job runner {}", job_runner_id);

    if !state.cancels.cancel(job_runner_id) {
        tracing::debug!("Job runner {} is not running here", job_runner_id);
        return StatusCode::OK;
    }

    state
        .executor
        .step_log(job_runner_id)
        .line("Received job interruption request, processing...");

    StatusCode::OK
}
