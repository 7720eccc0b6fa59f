//! Pipeline Service
//!
//! Pipeline definitions: creation with validation, lookup and removal.

use std::collections::HashSet;

use keel_core::domain::pipeline::Pipeline;
use keel_core::dto::pipeline::{CreatePipeline, PipelineDetails};

use super::{Result, ServiceError};
use crate::repository::Store;

/// Create a pipeline with its stages and steps
pub async fn create_pipeline(store: &dyn Store, req: CreatePipeline) -> Result<PipelineDetails> {
    validate_pipeline_request(&req)?;

    let details = store.create_pipeline(&req).await?;

    tracing::info!(
        "Pipeline created: {} ({}) with {} step(s)",
        details.pipeline.name,
        details.pipeline.id,
        details.steps.len()
    );

    Ok(details)
}

/// Get a pipeline with its stages and steps
pub async fn get_pipeline(store: &dyn Store, id: i64) -> Result<PipelineDetails> {
    let pipeline = store
        .get_pipeline(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("pipeline {}", id)))?;

    Ok(PipelineDetails {
        stages: store.list_stages(id).await?,
        steps: store.list_steps(id).await?,
        pipeline,
    })
}

/// List all pipelines
pub async fn list_pipelines(store: &dyn Store) -> Result<Vec<Pipeline>> {
    Ok(store.list_pipelines().await?)
}

/// Delete a pipeline that has nothing in flight
pub async fn delete_pipeline(store: &dyn Store, id: i64) -> Result<()> {
    if !store.active_job_runners(id).await?.is_empty() {
        return Err(ServiceError::Conflict(format!(
            "pipeline {} has a job in progress",
            id
        )));
    }

    if !store.delete_pipeline(id).await? {
        return Err(ServiceError::NotFound(format!("pipeline {}", id)));
    }

    tracing::info!("Pipeline deleted: {}", id);

    Ok(())
}

// =============================================================================
// Validation
// =============================================================================

fn validate_pipeline_request(req: &CreatePipeline) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(ServiceError::Validation(
            "Pipeline name cannot be empty".to_string(),
        ));
    }

    if req.steps.is_empty() {
        return Err(ServiceError::Validation(
            "Pipeline must define at least one step".to_string(),
        ));
    }

    if let Some(git) = &req.git {
        if git.repository.trim().is_empty() || git.branch.trim().is_empty() {
            return Err(ServiceError::Validation(
                "Git binding needs a repository and a branch".to_string(),
            ));
        }
    }

    let mut stage_names = HashSet::new();
    for stage in &req.stages {
        if !stage_names.insert(stage.name.as_str()) {
            return Err(ServiceError::Validation(format!(
                "Duplicate stage name '{}'",
                stage.name
            )));
        }
    }

    for step in &req.steps {
        if step.name.trim().is_empty() {
            return Err(ServiceError::Validation(
                "Step name cannot be empty".to_string(),
            ));
        }

        if step.commands.is_empty() {
            return Err(ServiceError::Validation(format!(
                "Step '{}' has no commands",
                step.name
            )));
        }

        if step.runner_label.trim().is_empty() {
            return Err(ServiceError::Validation(format!(
                "Step '{}' needs a runner label",
                step.name
            )));
        }

        if let Some(stage) = &step.stage {
            if !stage_names.contains(stage.as_str()) {
                return Err(ServiceError::Validation(format!(
                    "Step '{}' refers to unknown stage '{}'",
                    step.name, stage
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;
    use crate::testing::pipeline_request;
    use keel_core::domain::pipeline::Trigger;
    use keel_core::dto::pipeline::CreateStage;

    fn valid() -> CreatePipeline {
        pipeline_request("app", &[("build", Trigger::Auto, false)])
    }

    #[test]
    fn test_validate_empty_name() {
        let req = CreatePipeline {
            name: "  ".to_string(),
            ..valid()
        };
        assert!(matches!(
            validate_pipeline_request(&req),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_no_steps() {
        let req = CreatePipeline {
            steps: vec![],
            ..valid()
        };
        assert!(matches!(
            validate_pipeline_request(&req),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_step_without_commands() {
        let mut req = valid();
        req.steps[0].commands.clear();
        assert!(validate_pipeline_request(&req).is_err());
    }

    #[test]
    fn test_validate_unknown_stage() {
        let mut req = valid();
        req.steps[0].stage = Some("missing".to_string());
        assert!(validate_pipeline_request(&req).is_err());

        req.stages.push(CreateStage {
            name: "missing".to_string(),
            parallel: false,
        });
        assert!(validate_pipeline_request(&req).is_ok());
    }

    #[test]
    fn test_validate_valid_request() {
        assert!(validate_pipeline_request(&valid()).is_ok());
    }

    #[tokio::test]
    async fn test_create_and_get_pipeline() {
        let store = MemoryStore::new();
        let created = create_pipeline(&store, valid()).await.unwrap();
        let fetched = get_pipeline(&store, created.pipeline.id).await.unwrap();

        assert_eq!(fetched.pipeline.name, "app");
        assert_eq!(fetched.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let store = MemoryStore::new();
        create_pipeline(&store, valid()).await.unwrap();
        assert!(matches!(
            create_pipeline(&store, valid()).await,
            Err(ServiceError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_pipeline() {
        let store = MemoryStore::new();
        assert!(matches!(
            delete_pipeline(&store, 42).await,
            Err(ServiceError::NotFound(_))
        ));
    }
}
