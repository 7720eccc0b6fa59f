//! Runner Repository
//!
//! Registered execution agents and their soft locks.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use keel_core::domain::runner::{Runner, RunnerAssignment, RunnerStatus};
use keel_core::dto::runner::RegisterRunner;

use crate::repository::StoreResult;

const COLUMNS: &str = "id, name, endpoint, ip, labels, status, enabled, lock_pipeline_id, \
                       lock_pipeline_name, lock_stage_id, lock_stage_parallel, registered_at, \
                       updated_at";

/// Insert a runner, or refresh the one registered under the same name
pub async fn upsert(pool: &PgPool, req: &RegisterRunner) -> StoreResult<Runner> {
    let now = Utc::now();

    let row = sqlx::query_as::<_, RunnerRow>(&format!(
        r#"
        INSERT INTO runners (name, endpoint, ip, labels, status, enabled, registered_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, TRUE, $6, $6)
        ON CONFLICT (name) DO UPDATE
        SET endpoint = EXCLUDED.endpoint,
            ip = EXCLUDED.ip,
            labels = EXCLUDED.labels,
            status = EXCLUDED.status,
            updated_at = EXCLUDED.updated_at
        RETURNING {COLUMNS}
        "#
    ))
    .bind(&req.name)
    .bind(&req.endpoint)
    .bind(&req.ip)
    .bind(&req.labels)
    .bind(RunnerStatus::Online.as_str())
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(row.into())
}

pub async fn find_by_id(pool: &PgPool, id: i64) -> StoreResult<Option<Runner>> {
    let row = sqlx::query_as::<_, RunnerRow>(&format!("SELECT {COLUMNS} FROM runners WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(Runner::from))
}

pub async fn find_by_name(pool: &PgPool, name: &str) -> StoreResult<Option<Runner>> {
    let row =
        sqlx::query_as::<_, RunnerRow>(&format!("SELECT {COLUMNS} FROM runners WHERE name = $1"))
            .bind(name)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(Runner::from))
}

pub async fn list_all(pool: &PgPool) -> StoreResult<Vec<Runner>> {
    let rows = sqlx::query_as::<_, RunnerRow>(&format!("SELECT {COLUMNS} FROM runners ORDER BY id"))
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(Runner::from).collect())
}

pub async fn update_status(pool: &PgPool, id: i64, status: RunnerStatus) -> StoreResult<bool> {
    let result = sqlx::query("UPDATE runners SET status = $1, updated_at = $2 WHERE id = $3")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn update_enabled(pool: &PgPool, id: i64, enabled: bool) -> StoreResult<bool> {
    let result = sqlx::query("UPDATE runners SET enabled = $1, updated_at = $2 WHERE id = $3")
        .bind(enabled)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn assign(pool: &PgPool, id: i64, assignment: &RunnerAssignment) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE runners
        SET lock_pipeline_id = $1, lock_pipeline_name = $2, lock_stage_id = $3,
            lock_stage_parallel = $4, updated_at = $5
        WHERE id = $6
        "#,
    )
    .bind(assignment.pipeline_id)
    .bind(&assignment.pipeline_name)
    .bind(assignment.stage_id)
    .bind(assignment.stage_parallel)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn release(pool: &PgPool, id: i64) -> StoreResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE runners
        SET lock_pipeline_id = NULL, lock_pipeline_name = NULL, lock_stage_id = NULL,
            lock_stage_parallel = FALSE, updated_at = $1
        WHERE id = $2
        "#,
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn delete(pool: &PgPool, id: i64) -> StoreResult<bool> {
    let result = sqlx::query("DELETE FROM runners WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunnerRow {
    id: i64,
    name: String,
    endpoint: String,
    ip: Option<String>,
    labels: Vec<String>,
    status: String,
    enabled: bool,
    lock_pipeline_id: Option<i64>,
    lock_pipeline_name: Option<String>,
    lock_stage_id: Option<i64>,
    lock_stage_parallel: bool,
    registered_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RunnerRow> for Runner {
    fn from(row: RunnerRow) -> Self {
        let assignment = row.lock_pipeline_id.map(|pipeline_id| RunnerAssignment {
            pipeline_id,
            pipeline_name: row.lock_pipeline_name.unwrap_or_default(),
            stage_id: row.lock_stage_id,
            stage_parallel: row.lock_stage_parallel,
        });

        Runner {
            id: row.id,
            name: row.name,
            endpoint: row.endpoint,
            ip: row.ip,
            labels: row.labels,
            status: RunnerStatus::parse(&row.status),
            enabled: row.enabled,
            assignment,
            registered_at: row.registered_at,
            updated_at: row.updated_at,
        }
    }
}
