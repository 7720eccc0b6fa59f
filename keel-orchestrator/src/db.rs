use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Pipelines, with the optional git binding inlined
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipelines (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL UNIQUE,
            tag_template TEXT NOT NULL,
            envs JSONB NOT NULL DEFAULT '{}',
            git_repository TEXT,
            git_branch TEXT,
            git_username TEXT,
            git_password TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stages (
            id BIGSERIAL PRIMARY KEY,
            pipeline_id BIGINT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
            name VARCHAR(255) NOT NULL,
            parallel BOOLEAN NOT NULL DEFAULT FALSE,
            sort INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS steps (
            id BIGSERIAL PRIMARY KEY,
            pipeline_id BIGINT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
            stage_id BIGINT REFERENCES stages(id) ON DELETE SET NULL,
            name VARCHAR(255) NOT NULL,
            commands TEXT[] NOT NULL DEFAULT '{}',
            trigger VARCHAR(20) NOT NULL,
            runner_label VARCHAR(255) NOT NULL,
            multiple_runner_exec BOOLEAN NOT NULL DEFAULT FALSE,
            sort INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id BIGSERIAL PRIMARY KEY,
            pipeline_id BIGINT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
            tag TEXT NOT NULL DEFAULT '',
            envs JSONB NOT NULL DEFAULT '{}',
            commit_id TEXT,
            branch TEXT,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Steps may be deleted later; job runners keep their own snapshot
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_runners (
            id BIGSERIAL PRIMARY KEY,
            job_id BIGINT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            step_id BIGINT NOT NULL,
            stage_id BIGINT,
            parallel BOOLEAN NOT NULL DEFAULT FALSE,
            step_sort INTEGER NOT NULL,
            commands TEXT[] NOT NULL DEFAULT '{}',
            trigger VARCHAR(20) NOT NULL,
            status VARCHAR(50) NOT NULL,
            event_success INTEGER NOT NULL DEFAULT 0,
            event_failed INTEGER NOT NULL DEFAULT 0,
            message TEXT NOT NULL DEFAULT '',
            assign_runner_ids BIGINT[] NOT NULL DEFAULT '{}',
            reported_runner_ids BIGINT[] NOT NULL DEFAULT '{}',
            start_time TIMESTAMPTZ,
            end_time TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runners (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL UNIQUE,
            endpoint TEXT NOT NULL,
            ip TEXT,
            labels TEXT[] NOT NULL DEFAULT '{}',
            status VARCHAR(20) NOT NULL,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            lock_pipeline_id BIGINT,
            lock_pipeline_name TEXT,
            lock_stage_id BIGINT,
            lock_stage_parallel BOOLEAN NOT NULL DEFAULT FALSE,
            registered_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_logs (
            id BIGSERIAL PRIMARY KEY,
            job_runner_id BIGINT NOT NULL REFERENCES job_runners(id) ON DELETE CASCADE,
            line TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for the dispatcher and aggregator lookups
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_runners_status ON job_runners(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_runners_job_id ON job_runners(job_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_pipeline_id ON jobs(pipeline_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_logs_job_runner_id ON job_logs(job_runner_id, id)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
