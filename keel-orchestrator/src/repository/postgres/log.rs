//! Log Repository

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use keel_core::domain::log::LogLine;

use crate::repository::StoreResult;

/// Append one line to a job runner's log
pub async fn append(pool: &PgPool, job_runner_id: i64, line: &str) -> StoreResult<()> {
    sqlx::query("INSERT INTO job_logs (job_runner_id, line, created_at) VALUES ($1, $2, $3)")
        .bind(job_runner_id)
        .bind(line)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    Ok(())
}

/// Lines of a job runner in arrival order
pub async fn find_by_job_runner(pool: &PgPool, job_runner_id: i64) -> StoreResult<Vec<LogLine>> {
    let rows = sqlx::query_as::<_, LogRow>(
        r#"
        SELECT id, job_runner_id, line, created_at
        FROM job_logs
        WHERE job_runner_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(job_runner_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(LogLine::from).collect())
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: i64,
    job_runner_id: i64,
    line: String,
    created_at: DateTime<Utc>,
}

impl From<LogRow> for LogLine {
    fn from(row: LogRow) -> Self {
        LogLine {
            id: row.id,
            job_runner_id: row.job_runner_id,
            line: row.line,
            created_at: row.created_at,
        }
    }
}
