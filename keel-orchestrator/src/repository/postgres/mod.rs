//! PostgreSQL store
//!
//! Each entity has its own module of free functions over a pool; [`PgStore`]
//! only routes the [`Store`] trait to them.

pub mod job;
pub mod job_runner;
pub mod log;
pub mod pipeline;
pub mod runner;

use async_trait::async_trait;
use sqlx::PgPool;

use keel_core::domain::job::Job;
use keel_core::domain::job_runner::{JobRunner, JobRunnerStatus};
use keel_core::domain::log::LogLine;
use keel_core::domain::pipeline::{Pipeline, Stage, Step};
use keel_core::domain::runner::{Runner, RunnerAssignment, RunnerStatus};
use keel_core::dto::pipeline::{CreatePipeline, PipelineDetails};
use keel_core::dto::runner::RegisterRunner;

use super::{EventRecord, NewJob, Store, StoreResult};

/// Store backed by PostgreSQL
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_pipeline(&self, req: &CreatePipeline) -> StoreResult<PipelineDetails> {
        pipeline::create(&self.pool, req).await
    }

    async fn get_pipeline(&self, id: i64) -> StoreResult<Option<Pipeline>> {
        pipeline::find_by_id(&self.pool, id).await
    }

    async fn list_pipelines(&self) -> StoreResult<Vec<Pipeline>> {
        pipeline::list_all(&self.pool).await
    }

    async fn delete_pipeline(&self, id: i64) -> StoreResult<bool> {
        pipeline::delete(&self.pool, id).await
    }

    async fn list_stages(&self, pipeline_id: i64) -> StoreResult<Vec<Stage>> {
        pipeline::list_stages(&self.pool, pipeline_id).await
    }

    async fn list_steps(&self, pipeline_id: i64) -> StoreResult<Vec<Step>> {
        pipeline::list_steps(&self.pool, pipeline_id).await
    }

    async fn get_step(&self, id: i64) -> StoreResult<Option<Step>> {
        pipeline::find_step(&self.pool, id).await
    }

    async fn create_job(&self, new: NewJob) -> StoreResult<(Job, Vec<JobRunner>)> {
        job::create(&self.pool, new).await
    }

    async fn get_job(&self, id: i64) -> StoreResult<Option<Job>> {
        job::find_by_id(&self.pool, id).await
    }

    async fn list_jobs(&self, pipeline_id: i64) -> StoreResult<Vec<Job>> {
        job::find_by_pipeline(&self.pool, pipeline_id).await
    }

    async fn get_job_runner(&self, id: i64) -> StoreResult<Option<JobRunner>> {
        job_runner::find_by_id(&self.pool, id).await
    }

    async fn list_job_runners(&self, job_id: i64) -> StoreResult<Vec<JobRunner>> {
        job_runner::find_by_job(&self.pool, job_id).await
    }

    async fn active_job_runners(&self, pipeline_id: i64) -> StoreResult<Vec<JobRunner>> {
        job_runner::find_active_for_pipeline(&self.pool, pipeline_id).await
    }

    async fn queueing_job_runners(&self) -> StoreResult<Vec<JobRunner>> {
        job_runner::find_queueing(&self.pool).await
    }

    async fn next_pending_after(&self, current: &JobRunner) -> StoreResult<Option<JobRunner>> {
        job_runner::find_next_pending(&self.pool, current).await
    }

    async fn rerun_job_runner(&self, source: &JobRunner) -> StoreResult<JobRunner> {
        job_runner::rerun(&self.pool, source).await
    }

    async fn transition_job_runner(
        &self,
        id: i64,
        to: JobRunnerStatus,
        message: Option<&str>,
    ) -> StoreResult<bool> {
        job_runner::transition(&self.pool, id, to, message).await
    }

    async fn record_dispatch(
        &self,
        id: i64,
        status: JobRunnerStatus,
        assigned: &[i64],
        message: Option<&str>,
    ) -> StoreResult<bool> {
        job_runner::record_dispatch(&self.pool, id, status, assigned, message).await
    }

    async fn record_event(
        &self,
        id: i64,
        runner_id: Option<i64>,
        success: bool,
        message: &str,
    ) -> StoreResult<EventRecord> {
        job_runner::record_event(&self.pool, id, runner_id, success, message).await
    }

    async fn upsert_runner(&self, req: &RegisterRunner) -> StoreResult<Runner> {
        runner::upsert(&self.pool, req).await
    }

    async fn get_runner(&self, id: i64) -> StoreResult<Option<Runner>> {
        runner::find_by_id(&self.pool, id).await
    }

    async fn find_runner_by_name(&self, name: &str) -> StoreResult<Option<Runner>> {
        runner::find_by_name(&self.pool, name).await
    }

    async fn list_runners(&self) -> StoreResult<Vec<Runner>> {
        runner::list_all(&self.pool).await
    }

    async fn set_runner_status(&self, id: i64, status: RunnerStatus) -> StoreResult<bool> {
        runner::update_status(&self.pool, id, status).await
    }

    async fn set_runner_enabled(&self, id: i64, enabled: bool) -> StoreResult<bool> {
        runner::update_enabled(&self.pool, id, enabled).await
    }

    async fn assign_runner(&self, id: i64, assignment: &RunnerAssignment) -> StoreResult<bool> {
        runner::assign(&self.pool, id, assignment).await
    }

    async fn release_runner(&self, id: i64) -> StoreResult<bool> {
        runner::release(&self.pool, id).await
    }

    async fn delete_runner(&self, id: i64) -> StoreResult<bool> {
        runner::delete(&self.pool, id).await
    }

    async fn append_log(&self, job_runner_id: i64, line: &str) -> StoreResult<()> {
        log::append(&self.pool, job_runner_id, line).await
    }

    async fn list_logs(&self, job_runner_id: i64) -> StoreResult<Vec<LogLine>> {
        log::find_by_job_runner(&self.pool, job_runner_id).await
    }
}
