//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod agent;
pub mod error;
pub mod health;
pub mod job;
pub mod pipeline;
pub mod runner;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post, put},
};
use tower_http::trace::TraceLayer;

use crate::git::CommitResolver;
use crate::repository::Store;
use crate::scheduler::{AgentTransport, AggregatorHandle, DispatchHandle};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub agents: Arc<dyn AgentTransport>,
    pub resolver: Arc<dyn CommitResolver>,
    pub dispatcher: DispatchHandle,
    pub aggregator: AggregatorHandle,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Agent-facing endpoints
        .route("/register_runner", post(runner::register_runner))
        .route("/events/{job_runner_id}", post(agent::post_event))
        .route("/logs/{job_runner_id}", post(agent::post_log))
        // Runner registry
        .route("/runners", get(runner::list_runners))
        .route("/runners/{id}/enable", put(runner::enable_runner))
        .route("/runners/{id}/release", put(runner::release_runner))
        .route("/runners/{id}", delete(runner::delete_runner))
        // Pipelines
        .route(
            "/pipelines",
            get(pipeline::list_pipelines).post(pipeline::create_pipeline),
        )
        .route(
            "/pipelines/{id}",
            get(pipeline::get_pipeline).delete(pipeline::delete_pipeline),
        )
        .route(
            "/pipelines/{id}/jobs",
            get(job::list_jobs).post(job::launch_job),
        )
        // Jobs and step executions
        .route("/jobs/{id}", get(job::get_job))
        .route("/job_runners/{id}", get(job::get_job_runner))
        .route("/job_runners/{id}/start", post(job::start_job_runner))
        .route("/job_runners/{id}/cancel", post(job::cancel_job_runner))
        .route("/job_runners/{id}/logs", get(job::get_job_runner_logs))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
