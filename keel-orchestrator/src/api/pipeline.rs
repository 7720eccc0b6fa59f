//! Pipeline API Handlers
//!
//! HTTP endpoints for pipeline definitions.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use keel_core::domain::pipeline::Pipeline;
use keel_core::dto::pipeline::{CreatePipeline, PipelineDetails};

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::pipeline_service;

/// POST /pipelines
pub async fn create_pipeline(
    State(state): State<AppState>,
    Json(req): Json<CreatePipeline>,
) -> ApiResult<(StatusCode, Json<PipelineDetails>)> {
    tracing::info!("Creating pipeline: {}", req.name);

    let details = pipeline_service::create_pipeline(&*state.store, req).await?;
    Ok((StatusCode::CREATED, Json(details)))
}

/// GET /pipelines
pub async fn list_pipelines(State(state): State<AppState>) -> ApiResult<Json<Vec<Pipeline>>> {
    Ok(Json(pipeline_service::list_pipelines(&*state.store).await?))
}

/// GET /pipelines/{id}
pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<PipelineDetails>> {
    Ok(Json(pipeline_service::get_pipeline(&*state.store, id).await?))
}

/// DELETE /pipelines/{id}
pub async fn delete_pipeline(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    pipeline_service::delete_pipeline(&*state.store, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
