//! Service Module
//!
//! Business logic layer for the orchestrator. Services validate requests,
//! coordinate the store with the scheduler queues and translate storage
//! failures into [`ServiceError`].

pub mod job;
pub mod log;
pub mod pipeline;
pub mod runner;

// Re-export for convenience
pub use job as job_service;
pub use log as log_service;
pub use pipeline as pipeline_service;
pub use runner as runner_service;

use thiserror::Error;

use crate::git::ResolveError;
use crate::repository::StoreError;

/// Service error type
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    /// The request clashes with current state
    #[error("{0}")]
    Conflict(String),

    #[error("failed to resolve commit: {0}")]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ServiceError::Conflict(msg),
            StoreError::Missing(what) => ServiceError::NotFound(what),
            other => ServiceError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
