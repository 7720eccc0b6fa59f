//! Job API Handlers
//!
//! HTTP endpoints for launching jobs and managing step executions.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use keel_core::domain::job::Job;
use keel_core::domain::job_runner::JobRunner;
use keel_core::domain::log::LogLine;
use keel_core::dto::job::{JobDetails, StartJob};

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::{job_service, log_service};

// =============================================================================
// Jobs
// =============================================================================

/// POST /pipelines/{id}/jobs
/// Launch a job; the body may be omitted
pub async fn launch_job(
    State(state): State<AppState>,
    Path(pipeline_id): Path<i64>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<JobDetails>)> {
    tracing::info!("Launching job for pipeline: {}", pipeline_id);

    let req: StartJob = if body.is_empty() {
        StartJob::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let details = job_service::launch_job(
        &*state.store,
        &*state.resolver,
        &state.dispatcher,
        pipeline_id,
        req,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(details)))
}

/// GET /pipelines/{id}/jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    Path(pipeline_id): Path<i64>,
) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(job_service::list_jobs(&*state.store, pipeline_id).await?))
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<JobDetails>> {
    Ok(Json(job_service::get_job(&*state.store, id).await?))
}

// =============================================================================
// Step executions
// =============================================================================

/// GET /job_runners/{id}
pub async fn get_job_runner(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<JobRunner>> {
    Ok(Json(job_service::get_job_runner(&*state.store, id).await?))
}

/// POST /job_runners/{id}/start
/// Run a pending manual step or re-run a finished one
pub async fn start_job_runner(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<JobRunner>> {
    let job_runner = job_service::start_job_runner(&*state.store, &state.dispatcher, id).await?;
    Ok(Json(job_runner))
}

/// POST /job_runners/{id}/cancel
pub async fn cancel_job_runner(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<JobRunner>> {
    tracing::info!("Canceling job runner: {}", id);

    let job_runner = job_service::cancel_job_runner(&*state.store, &*state.agents, id).await?;
    Ok(Json(job_runner))
}

/// GET /job_runners/{id}/logs
pub async fn get_job_runner_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<LogLine>>> {
    Ok(Json(log_service::list_logs(&*state.store, id).await?))
}
