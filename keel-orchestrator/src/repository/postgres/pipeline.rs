//! Pipeline Repository
//!
//! Pipelines, their stages and steps.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use keel_core::domain::pipeline::{GitBinding, Pipeline, Stage, Step, Trigger};
use keel_core::dto::pipeline::{CreatePipeline, PipelineDetails};

use crate::repository::{StoreError, StoreResult};

const PIPELINE_COLUMNS: &str = "id, name, tag_template, envs, git_repository, git_branch, \
                                git_username, git_password, created_at, updated_at";

const STEP_COLUMNS: &str =
    "id, pipeline_id, stage_id, name, commands, trigger, runner_label, multiple_runner_exec, sort";

/// Insert a pipeline with its stages and steps in one transaction
pub async fn create(pool: &PgPool, req: &CreatePipeline) -> StoreResult<PipelineDetails> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();
    let git = req.git.as_ref();

    let row = sqlx::query_as::<_, PipelineRow>(&format!(
        r#"
        INSERT INTO pipelines (name, tag_template, envs, git_repository, git_branch,
                               git_username, git_password, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
        RETURNING {PIPELINE_COLUMNS}
        "#
    ))
    .bind(&req.name)
    .bind(&req.tag_template)
    .bind(serde_json::to_value(&req.envs)?)
    .bind(git.map(|g| g.repository.clone()))
    .bind(git.map(|g| g.branch.clone()))
    .bind(git.and_then(|g| g.username.clone()))
    .bind(git.and_then(|g| g.password.clone()))
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| unique_violation(e, &req.name))?;

    let pipeline: Pipeline = row.try_into()?;

    let mut stages = Vec::with_capacity(req.stages.len());
    for (sort, stage) in req.stages.iter().enumerate() {
        let row = sqlx::query_as::<_, StageRow>(
            r#"
            INSERT INTO stages (pipeline_id, name, parallel, sort)
            VALUES ($1, $2, $3, $4)
            RETURNING id, pipeline_id, name, parallel, sort
            "#,
        )
        .bind(pipeline.id)
        .bind(&stage.name)
        .bind(stage.parallel)
        .bind(sort as i32)
        .fetch_one(&mut *tx)
        .await?;
        stages.push(Stage::from(row));
    }

    let mut steps = Vec::with_capacity(req.steps.len());
    for (sort, step) in req.steps.iter().enumerate() {
        let stage_id = match &step.stage {
            Some(name) => Some(
                stages
                    .iter()
                    .find(|s| &s.name == name)
                    .map(|s| s.id)
                    .ok_or_else(|| StoreError::Missing(format!("stage '{}'", name)))?,
            ),
            None => None,
        };

        let row = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            INSERT INTO steps (pipeline_id, stage_id, name, commands, trigger,
                               runner_label, multiple_runner_exec, sort)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(pipeline.id)
        .bind(stage_id)
        .bind(&step.name)
        .bind(&step.commands)
        .bind(step.trigger.as_str())
        .bind(&step.runner_label)
        .bind(step.multiple_runner_exec)
        .bind(sort as i32)
        .fetch_one(&mut *tx)
        .await?;
        steps.push(Step::from(row));
    }

    tx.commit().await?;

    Ok(PipelineDetails {
        pipeline,
        stages,
        steps,
    })
}

/// Find a pipeline by ID
pub async fn find_by_id(pool: &PgPool, id: i64) -> StoreResult<Option<Pipeline>> {
    let row = sqlx::query_as::<_, PipelineRow>(&format!(
        "SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Pipeline::try_from).transpose()
}

/// List all pipelines
pub async fn list_all(pool: &PgPool) -> StoreResult<Vec<Pipeline>> {
    let rows = sqlx::query_as::<_, PipelineRow>(&format!(
        "SELECT {PIPELINE_COLUMNS} FROM pipelines ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Pipeline::try_from).collect()
}

/// Delete a pipeline; stages, steps, jobs and logs cascade
pub async fn delete(pool: &PgPool, id: i64) -> StoreResult<bool> {
    let result = sqlx::query("DELETE FROM pipelines WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn list_stages(pool: &PgPool, pipeline_id: i64) -> StoreResult<Vec<Stage>> {
    let rows = sqlx::query_as::<_, StageRow>(
        r#"
        SELECT id, pipeline_id, name, parallel, sort
        FROM stages
        WHERE pipeline_id = $1
        ORDER BY sort, id
        "#,
    )
    .bind(pipeline_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Stage::from).collect())
}

pub async fn list_steps(pool: &PgPool, pipeline_id: i64) -> StoreResult<Vec<Step>> {
    let rows = sqlx::query_as::<_, StepRow>(&format!(
        "SELECT {STEP_COLUMNS} FROM steps WHERE pipeline_id = $1 ORDER BY sort, id"
    ))
    .bind(pipeline_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Step::from).collect())
}

pub async fn find_step(pool: &PgPool, id: i64) -> StoreResult<Option<Step>> {
    let row = sqlx::query_as::<_, StepRow>(&format!(
        "SELECT {STEP_COLUMNS} FROM steps WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Step::from))
}

fn unique_violation(err: sqlx::Error, name: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(format!("pipeline name '{}' already exists", name))
        }
        _ => StoreError::Database(err),
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: i64,
    name: String,
    tag_template: String,
    envs: serde_json::Value,
    git_repository: Option<String>,
    git_branch: Option<String>,
    git_username: Option<String>,
    git_password: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PipelineRow> for Pipeline {
    type Error = StoreError;

    fn try_from(row: PipelineRow) -> Result<Self, Self::Error> {
        let git = match (row.git_repository, row.git_branch) {
            (Some(repository), Some(branch)) => Some(GitBinding {
                repository,
                branch,
                username: row.git_username,
                password: row.git_password,
                commit_id: None,
            }),
            _ => None,
        };

        Ok(Pipeline {
            id: row.id,
            name: row.name,
            tag_template: row.tag_template,
            envs: serde_json::from_value(row.envs)?,
            git,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    id: i64,
    pipeline_id: i64,
    name: String,
    parallel: bool,
    sort: i32,
}

impl From<StageRow> for Stage {
    fn from(row: StageRow) -> Self {
        Stage {
            id: row.id,
            pipeline_id: row.pipeline_id,
            name: row.name,
            parallel: row.parallel,
            sort: row.sort,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: i64,
    pipeline_id: i64,
    stage_id: Option<i64>,
    name: String,
    commands: Vec<String>,
    trigger: String,
    runner_label: String,
    multiple_runner_exec: bool,
    sort: i32,
}

impl From<StepRow> for Step {
    fn from(row: StepRow) -> Self {
        Step {
            id: row.id,
            pipeline_id: row.pipeline_id,
            stage_id: row.stage_id,
            name: row.name,
            commands: row.commands,
            trigger: Trigger::parse(&row.trigger),
            runner_label: row.runner_label,
            multiple_runner_exec: row.multiple_runner_exec,
            sort: row.sort,
        }
    }
}
