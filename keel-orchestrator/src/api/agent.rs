//! Agent Callback Handlers
//!
//! Fixed routes agents call while executing a step: completion events and
//! log lines. Events are queued for the aggregator and acknowledged at once.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use keel_core::dto::event::CompletionEvent;
use keel_core::dto::log::AppendLog;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::{job_service, log_service};

/// POST /events/{job_runner_id}
pub async fn post_event(
    State(state): State<AppState>,
    Path(job_runner_id): Path<i64>,
    Json(event): Json<CompletionEvent>,
) -> ApiResult<StatusCode> {
    job_service::report_event(&*state.store, &state.aggregator, job_runner_id, event).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /logs/{job_runner_id}
pub async fn post_log(
    State(state): State<AppState>,
    Path(job_runner_id): Path<i64>,
    Json(req): Json<AppendLog>,
) -> ApiResult<StatusCode> {
    log_service::append_log(&*state.store, job_runner_id, &req.log).await?;
    Ok(StatusCode::NO_CONTENT)
}
