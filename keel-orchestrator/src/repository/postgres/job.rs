//! Job Repository
//!
//! Jobs are created together with their job runners in one transaction.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use keel_core::domain::job::{Job, render_tag};
use keel_core::domain::job_runner::JobRunner;

use super::job_runner;
use crate::repository::{NewJob, StoreError, StoreResult};

const JOB_COLUMNS: &str = "id, pipeline_id, tag, envs, commit_id, branch, created_at";

/// Insert a job and its job runners
///
/// The tag is rendered once the job id is known.
pub async fn create(pool: &PgPool, new: NewJob) -> StoreResult<(Job, Vec<JobRunner>)> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO jobs (pipeline_id, envs, commit_id, branch, created_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(new.pipeline_id)
    .bind(serde_json::to_value(&new.envs)?)
    .bind(&new.commit_id)
    .bind(&new.branch)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    let row = sqlx::query_as::<_, JobRow>(&format!(
        "UPDATE jobs SET tag = $1 WHERE id = $2 RETURNING {JOB_COLUMNS}"
    ))
    .bind(render_tag(&new.tag_template, id, now))
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;

    let job = Job::try_from(row)?;

    let mut job_runners = Vec::with_capacity(new.job_runners.len());
    for row in &new.job_runners {
        job_runners.push(job_runner::insert(&mut tx, job.id, row, now).await?);
    }

    tx.commit().await?;

    Ok((job, job_runners))
}

/// Find a job by ID
pub async fn find_by_id(pool: &PgPool, id: i64) -> StoreResult<Option<Job>> {
    let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(Job::try_from).transpose()
}

/// Find jobs by pipeline ID, newest first
pub async fn find_by_pipeline(pool: &PgPool, pipeline_id: i64) -> StoreResult<Vec<Job>> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs WHERE pipeline_id = $1 ORDER BY id DESC"
    ))
    .bind(pipeline_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Job::try_from).collect()
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    pipeline_id: i64,
    tag: String,
    envs: serde_json::Value,
    commit_id: Option<String>,
    branch: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            pipeline_id: row.pipeline_id,
            tag: row.tag,
            envs: serde_json::from_value(row.envs)?,
            commit_id: row.commit_id,
            branch: row.branch,
            created_at: row.created_at,
        })
    }
}
