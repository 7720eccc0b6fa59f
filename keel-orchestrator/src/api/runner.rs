//! Runner API Handlers
//!
//! HTTP endpoints for runner registration and the registry.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use keel_core::domain::runner::Runner;
use keel_core::dto::runner::{EnableRunner, RegisterRunner};

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::runner_service;

/// POST /register_runner
pub async fn register_runner(
    State(state): State<AppState>,
    Json(req): Json<RegisterRunner>,
) -> ApiResult<Json<Runner>> {
    tracing::info!("Registering runner: {}", req.name);

    let runner = runner_service::register_runner(&*state.store, req).await?;
    Ok(Json(runner))
}

/// GET /runners
pub async fn list_runners(State(state): State<AppState>) -> ApiResult<Json<Vec<Runner>>> {
    Ok(Json(runner_service::list_runners(&*state.store).await?))
}

/// PUT /runners/{id}/enable
pub async fn enable_runner(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<EnableRunner>,
) -> ApiResult<Json<Runner>> {
    let runner = runner_service::enable_runner(&*state.store, id, req.enabled).await?;
    Ok(Json(runner))
}

/// PUT /runners/{id}/release
/// Clear a stuck soft lock
pub async fn release_runner(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Runner>> {
    Ok(Json(runner_service::release_runner(&*state.store, id).await?))
}

/// DELETE /runners/{id}
pub async fn delete_runner(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    runner_service::delete_runner(&*state.store, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
