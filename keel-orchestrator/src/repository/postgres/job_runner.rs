//! Job Runner Repository
//!
//! Step executions. Status writes carry their guard in the `WHERE` clause;
//! event counting locks the row for the read-modify-write.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use keel_core::domain::job_runner::{EventCounts, JobRunner, JobRunnerStatus};
use keel_core::domain::pipeline::Trigger;

use crate::repository::{EventRecord, NewJobRunner, StoreError, StoreResult, apply_event};

const COLUMNS: &str = "id, job_id, step_id, stage_id, parallel, step_sort, commands, trigger, \
                       status, event_success, event_failed, message, assign_runner_ids, \
                       reported_runner_ids, start_time, end_time, created_at";

/// Appends `$n` to `message`, joining with "; "
const APPEND_MESSAGE: &str =
    "CASE WHEN {m} = '' THEN message WHEN message = '' THEN {m} ELSE message || '; ' || {m} END";

fn append_message_sql(param: &str) -> String {
    APPEND_MESSAGE.replace("{m}", param)
}

/// Insert one job runner
pub async fn insert(
    conn: &mut PgConnection,
    job_id: i64,
    new: &NewJobRunner,
    now: DateTime<Utc>,
) -> StoreResult<JobRunner> {
    let row = sqlx::query_as::<_, JobRunnerRow>(&format!(
        r#"
        INSERT INTO job_runners (job_id, step_id, stage_id, parallel, step_sort, commands,
                                 trigger, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {COLUMNS}
        "#
    ))
    .bind(job_id)
    .bind(new.step_id)
    .bind(new.stage_id)
    .bind(new.parallel)
    .bind(new.step_sort)
    .bind(&new.commands)
    .bind(new.trigger.as_str())
    .bind(new.status.as_str())
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    row.try_into()
}

pub async fn find_by_id(pool: &PgPool, id: i64) -> StoreResult<Option<JobRunner>> {
    let row = sqlx::query_as::<_, JobRunnerRow>(&format!(
        "SELECT {COLUMNS} FROM job_runners WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(JobRunner::try_from).transpose()
}

pub async fn find_by_job(pool: &PgPool, job_id: i64) -> StoreResult<Vec<JobRunner>> {
    let rows = sqlx::query_as::<_, JobRunnerRow>(&format!(
        "SELECT {COLUMNS} FROM job_runners WHERE job_id = $1 ORDER BY step_sort, step_id, id"
    ))
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(JobRunner::try_from).collect()
}

pub async fn find_active_for_pipeline(
    pool: &PgPool,
    pipeline_id: i64,
) -> StoreResult<Vec<JobRunner>> {
    let active: Vec<&str> = JobRunnerStatus::ALL
        .iter()
        .filter(|s| s.is_active())
        .map(|s| s.as_str())
        .collect();

    let rows = sqlx::query_as::<_, JobRunnerRow>(&format!(
        r#"
        SELECT {}
        FROM job_runners jr
        JOIN jobs j ON j.id = jr.job_id
        WHERE j.pipeline_id = $1 AND jr.status = ANY($2)
        ORDER BY jr.id
        "#,
        qualified_columns("jr")
    ))
    .bind(pipeline_id)
    .bind(&active)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(JobRunner::try_from).collect()
}

pub async fn find_queueing(pool: &PgPool) -> StoreResult<Vec<JobRunner>> {
    let rows = sqlx::query_as::<_, JobRunnerRow>(&format!(
        "SELECT {COLUMNS} FROM job_runners WHERE status = $1 ORDER BY id"
    ))
    .bind(JobRunnerStatus::Queueing.as_str())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(JobRunner::try_from).collect()
}

pub async fn find_next_pending(pool: &PgPool, current: &JobRunner) -> StoreResult<Option<JobRunner>> {
    let row = sqlx::query_as::<_, JobRunnerRow>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM job_runners
        WHERE job_id = $1 AND status = $2 AND (step_sort, step_id) > ($3, $4)
        ORDER BY step_sort, step_id, id
        LIMIT 1
        "#
    ))
    .bind(current.job_id)
    .bind(JobRunnerStatus::Pending.as_str())
    .bind(current.step_sort)
    .bind(current.step_id)
    .fetch_optional(pool)
    .await?;

    row.map(JobRunner::try_from).transpose()
}

/// Insert a manual, queueing copy of `source`
pub async fn rerun(pool: &PgPool, source: &JobRunner) -> StoreResult<JobRunner> {
    let mut conn = pool.acquire().await?;
    let new = NewJobRunner {
        step_id: source.step_id,
        stage_id: source.stage_id,
        parallel: source.parallel,
        step_sort: source.step_sort,
        commands: source.commands.clone(),
        trigger: Trigger::Manual,
        status: JobRunnerStatus::Queueing,
    };

    insert(&mut conn, source.job_id, &new, Utc::now()).await
}

/// Guarded status change
pub async fn transition(
    pool: &PgPool,
    id: i64,
    to: JobRunnerStatus,
    message: Option<&str>,
) -> StoreResult<bool> {
    let sources: Vec<&str> = JobRunnerStatus::sources_of(to)
        .iter()
        .map(|s| s.as_str())
        .collect();
    if sources.is_empty() {
        return Ok(false);
    }

    let result = sqlx::query(&format!(
        r#"
        UPDATE job_runners
        SET status = $1,
            message = {},
            end_time = CASE WHEN $3 THEN $4 ELSE end_time END
        WHERE id = $5 AND status = ANY($6)
        "#,
        append_message_sql("$2")
    ))
    .bind(to.as_str())
    .bind(message.unwrap_or_default())
    .bind(to.is_terminal())
    .bind(Utc::now())
    .bind(id)
    .bind(&sources)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Write the assigned set once, together with the dispatch status
pub async fn record_dispatch(
    pool: &PgPool,
    id: i64,
    status: JobRunnerStatus,
    assigned: &[i64],
    message: Option<&str>,
) -> StoreResult<bool> {
    if !JobRunnerStatus::Assigning.can_transition_to(status) {
        return Ok(false);
    }

    let result = sqlx::query(&format!(
        r#"
        UPDATE job_runners
        SET status = $1,
            assign_runner_ids = $2,
            start_time = $3,
            end_time = CASE WHEN $4 THEN $3 ELSE end_time END,
            message = {}
        WHERE id = $6 AND status = $7 AND cardinality(assign_runner_ids) = 0
        "#,
        append_message_sql("$5")
    ))
    .bind(status.as_str())
    .bind(assigned)
    .bind(Utc::now())
    .bind(status.is_terminal())
    .bind(message.unwrap_or_default())
    .bind(id)
    .bind(JobRunnerStatus::Assigning.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Count one completion event under a row lock
pub async fn record_event(
    pool: &PgPool,
    id: i64,
    runner_id: Option<i64>,
    success: bool,
    message: &str,
) -> StoreResult<EventRecord> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as::<_, JobRunnerRow>(&format!(
        "SELECT {COLUMNS} FROM job_runners WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| StoreError::Missing(format!("job runner {}", id)))?;

    let mut job_runner = JobRunner::try_from(row)?;
    let record = apply_event(&mut job_runner, runner_id, success, message, Utc::now());

    if let EventRecord::Counted { job_runner, .. } = &record {
        sqlx::query(
            r#"
            UPDATE job_runners
            SET status = $1, event_success = $2, event_failed = $3, message = $4,
                reported_runner_ids = $5, end_time = $6
            WHERE id = $7
            "#,
        )
        .bind(job_runner.status.as_str())
        .bind(job_runner.event_status.success as i32)
        .bind(job_runner.event_status.failed as i32)
        .bind(&job_runner.message)
        .bind(&job_runner.reported_runner_ids)
        .bind(job_runner.end_time)
        .bind(job_runner.id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(record)
}

fn qualified_columns(alias: &str) -> String {
    COLUMNS
        .split(", ")
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRunnerRow {
    id: i64,
    job_id: i64,
    step_id: i64,
    stage_id: Option<i64>,
    parallel: bool,
    step_sort: i32,
    commands: Vec<String>,
    trigger: String,
    status: String,
    event_success: i32,
    event_failed: i32,
    message: String,
    assign_runner_ids: Vec<i64>,
    reported_runner_ids: Vec<i64>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRunnerRow> for JobRunner {
    type Error = StoreError;

    fn try_from(row: JobRunnerRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobRunnerStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(JobRunner {
            id: row.id,
            job_id: row.job_id,
            step_id: row.step_id,
            stage_id: row.stage_id,
            parallel: row.parallel,
            step_sort: row.step_sort,
            commands: row.commands,
            trigger: Trigger::parse(&row.trigger),
            status,
            event_status: EventCounts {
                success: row.event_success.max(0) as u32,
                failed: row.event_failed.max(0) as u32,
            },
            message: row.message,
            assign_runner_ids: row.assign_runner_ids,
            reported_runner_ids: row.reported_runner_ids,
            start_time: row.start_time,
            end_time: row.end_time,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_columns() {
        let cols = qualified_columns("jr");
        assert!(cols.starts_with("jr.id, jr.job_id"));
        assert!(cols.ends_with("jr.created_at"));
    }

    #[test]
    fn test_append_message_sql() {
        assert_eq!(
            append_message_sql("$2"),
            "CASE WHEN $2 = '' THEN message WHEN message = '' THEN $2 ELSE message || '; ' || $2 END"
        );
    }
}
