//! Runner Service
//!
//! Business logic for the runner registry.

use keel_core::domain::runner::Runner;
use keel_core::dto::runner::RegisterRunner;

use super::{Result, ServiceError};
use crate::repository::Store;

/// Register a runner with the orchestrator
///
/// Registration is keyed by name. Re-registering replaces the labels and
/// marks the runner online; a different endpoint under a known name is
/// rejected.
pub async fn register_runner(store: &dyn Store, req: RegisterRunner) -> Result<Runner> {
    validate_register_request(&req)?;

    if let Some(existing) = store.find_runner_by_name(&req.name).await? {
        if existing.endpoint != req.endpoint {
            return Err(ServiceError::Conflict(format!(
                "runner '{}' is already registered at {}",
                req.name, existing.endpoint
            )));
        }
    }

    let runner = store.upsert_runner(&req).await?;

    tracing::info!(
        "Runner registered: {} ({}) at {} with labels {:?}",
        runner.name,
        runner.id,
        runner.endpoint,
        runner.labels
    );

    Ok(runner)
}

/// List all runners
pub async fn list_runners(store: &dyn Store) -> Result<Vec<Runner>> {
    Ok(store.list_runners().await?)
}

/// Enable or disable a runner for new dispatches
pub async fn enable_runner(store: &dyn Store, id: i64, enabled: bool) -> Result<Runner> {
    if !store.set_runner_enabled(id, enabled).await? {
        return Err(ServiceError::NotFound(format!("runner {}", id)));
    }

    tracing::info!("Runner {} enabled: {}", id, enabled);

    get_runner(store, id).await
}

/// Clear a runner's soft lock by hand
///
/// For agents left locked by a completion event that never arrived.
pub async fn release_runner(store: &dyn Store, id: i64) -> Result<Runner> {
    if !store.release_runner(id).await? {
        return Err(ServiceError::NotFound(format!("runner {}", id)));
    }

    tracing::info!("Runner {} released", id);

    get_runner(store, id).await
}

/// Remove a runner from the registry
pub async fn delete_runner(store: &dyn Store, id: i64) -> Result<()> {
    if !store.delete_runner(id).await? {
        return Err(ServiceError::NotFound(format!("runner {}", id)));
    }

    tracing::info!("Runner {} deleted", id);

    Ok(())
}

pub async fn get_runner(store: &dyn Store, id: i64) -> Result<Runner> {
    store
        .get_runner(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("runner {}", id)))
}

fn validate_register_request(req: &RegisterRunner) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(ServiceError::Validation(
            "Runner name cannot be empty".to_string(),
        ));
    }

    if !req.endpoint.starts_with("http://") && !req.endpoint.starts_with("https://") {
        return Err(ServiceError::Validation(
            "Runner endpoint must start with http:// or https://".to_string(),
        ));
    }

    Ok(())
}
