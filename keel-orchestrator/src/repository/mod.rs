//! Repository Module
//!
//! Data access layer for the orchestrator. Everything the services, the
//! dispatcher and the aggregator persist goes through the [`Store`] trait,
//! which has a PostgreSQL backend and an in-memory one.
//!
//! Status writes are guarded: the backend only applies them while the row is
//! still in an allowed source status and reports `false` otherwise, so two
//! writers racing on one job runner never overwrite each other.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

use keel_core::domain::job::Job;
use keel_core::domain::job_runner::{JobRunner, JobRunnerStatus};
use keel_core::domain::log::LogLine;
use keel_core::domain::pipeline::{Pipeline, Stage, Step, Trigger};
use keel_core::domain::runner::{Runner, RunnerAssignment, RunnerStatus};
use keel_core::dto::pipeline::{CreatePipeline, PipelineDetails};
use keel_core::dto::runner::RegisterRunner;

/// Storage error type
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A uniqueness constraint was violated
    #[error("conflict: {0}")]
    Conflict(String),

    /// A referenced row does not exist
    #[error("{0} not found")]
    Missing(String),

    /// A stored value could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A job to create together with its step executions
#[derive(Debug, Clone)]
pub struct NewJob {
    pub pipeline_id: i64,
    /// Rendered with the job id once it is assigned
    pub tag_template: String,
    pub envs: BTreeMap<String, String>,
    pub commit_id: Option<String>,
    pub branch: Option<String>,
    pub job_runners: Vec<NewJobRunner>,
}

/// A step execution created alongside its job
#[derive(Debug, Clone)]
pub struct NewJobRunner {
    pub step_id: i64,
    pub stage_id: Option<i64>,
    pub parallel: bool,
    pub step_sort: i32,
    pub commands: Vec<String>,
    pub trigger: Trigger,
    pub status: JobRunnerStatus,
}

impl NewJobRunner {
    pub fn for_step(step: &Step, parallel: bool, status: JobRunnerStatus) -> Self {
        Self {
            step_id: step.id,
            stage_id: step.stage_id,
            parallel,
            step_sort: step.sort,
            commands: step.commands.clone(),
            trigger: step.trigger,
            status,
        }
    }
}

/// What happened to a completion event handed to [`Store::record_event`]
#[derive(Debug, Clone)]
pub enum EventRecord {
    /// The job runner was no longer running; nothing changed
    Ignored(JobRunnerStatus),

    /// This agent already reported for this job runner
    Duplicate,

    /// The reporting agent is not among the assigned ones
    Unassigned,

    /// The event was counted; `finalized` is set when it was the last one
    Counted {
        job_runner: JobRunner,
        finalized: Option<JobRunnerStatus>,
    },
}

/// Appends `extra` to an accumulated message
pub fn append_message(current: &str, extra: &str) -> String {
    match (current.is_empty(), extra.is_empty()) {
        (_, true) => current.to_string(),
        (true, false) => extra.to_string(),
        (false, false) => format!("{}; {}", current, extra),
    }
}

/// Applies a guarded transition to a loaded row
pub(crate) fn apply_transition(
    job_runner: &mut JobRunner,
    to: JobRunnerStatus,
    message: Option<&str>,
    now: DateTime<Utc>,
) -> bool {
    if !job_runner.status.can_transition_to(to) {
        return false;
    }

    job_runner.status = to;
    if let Some(message) = message {
        job_runner.message = append_message(&job_runner.message, message);
    }
    if to.is_terminal() {
        job_runner.end_time = Some(now);
    }
    true
}

/// Applies a completion event to a loaded row
///
/// Events are only counted while the row is running, at most once per
/// reporting agent, and never past the number of assigned agents.
pub(crate) fn apply_event(
    job_runner: &mut JobRunner,
    runner_id: Option<i64>,
    success: bool,
    message: &str,
    now: DateTime<Utc>,
) -> EventRecord {
    if !matches!(
        job_runner.status,
        JobRunnerStatus::Running | JobRunnerStatus::PartialRunning
    ) {
        return EventRecord::Ignored(job_runner.status);
    }

    if job_runner.event_status.total() as usize >= job_runner.assign_runner_ids.len() {
        return EventRecord::Ignored(job_runner.status);
    }

    if let Some(runner_id) = runner_id {
        if !job_runner.assign_runner_ids.contains(&runner_id) {
            return EventRecord::Unassigned;
        }
        if job_runner.reported_runner_ids.contains(&runner_id) {
            return EventRecord::Duplicate;
        }
        job_runner.reported_runner_ids.push(runner_id);
    }

    job_runner.event_status.record(success);
    job_runner.message = append_message(&job_runner.message, message);

    let finalized = job_runner
        .event_status
        .outcome(job_runner.assign_runner_ids.len());
    if let Some(status) = finalized {
        job_runner.status = status;
        job_runner.end_time = Some(now);
    }

    EventRecord::Counted {
        job_runner: job_runner.clone(),
        finalized,
    }
}

/// Ordering of job runners within a job
pub(crate) fn step_order(job_runner: &JobRunner) -> (i32, i64, i64) {
    (job_runner.step_sort, job_runner.step_id, job_runner.id)
}

#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Creates a pipeline with its stages and steps in one unit
    async fn create_pipeline(&self, req: &CreatePipeline) -> StoreResult<PipelineDetails>;

    async fn get_pipeline(&self, id: i64) -> StoreResult<Option<Pipeline>>;

    async fn list_pipelines(&self) -> StoreResult<Vec<Pipeline>>;

    /// Deletes a pipeline and everything hanging off it
    async fn delete_pipeline(&self, id: i64) -> StoreResult<bool>;

    async fn list_stages(&self, pipeline_id: i64) -> StoreResult<Vec<Stage>>;

    /// Steps of a pipeline ordered by `(sort, id)`
    async fn list_steps(&self, pipeline_id: i64) -> StoreResult<Vec<Step>>;

    async fn get_step(&self, id: i64) -> StoreResult<Option<Step>>;

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Creates a job and all of its job runners atomically
    async fn create_job(&self, new: NewJob) -> StoreResult<(Job, Vec<JobRunner>)>;

    async fn get_job(&self, id: i64) -> StoreResult<Option<Job>>;

    /// Jobs of a pipeline, newest first
    async fn list_jobs(&self, pipeline_id: i64) -> StoreResult<Vec<Job>>;

    // =========================================================================
    // Job runners
    // =========================================================================

    async fn get_job_runner(&self, id: i64) -> StoreResult<Option<JobRunner>>;

    /// Job runners of a job ordered by `(step_sort, step_id, id)`
    async fn list_job_runners(&self, job_id: i64) -> StoreResult<Vec<JobRunner>>;

    /// Job runners of a pipeline that are queued, being assigned or running
    async fn active_job_runners(&self, pipeline_id: i64) -> StoreResult<Vec<JobRunner>>;

    /// Every `queueing` job runner, oldest first
    async fn queueing_job_runners(&self) -> StoreResult<Vec<JobRunner>>;

    /// First `pending` job runner of the same job that comes after `current`
    /// in step order
    async fn next_pending_after(&self, current: &JobRunner) -> StoreResult<Option<JobRunner>>;

    /// Creates a fresh `queueing` row for the same step, triggered manually
    async fn rerun_job_runner(&self, source: &JobRunner) -> StoreResult<JobRunner>;

    /// Moves a job runner to `to` if its current status allows it
    ///
    /// `message` is appended to the accumulated message. Entering a terminal
    /// status stamps `end_time`.
    async fn transition_job_runner(
        &self,
        id: i64,
        to: JobRunnerStatus,
        message: Option<&str>,
    ) -> StoreResult<bool>;

    /// Records the outcome of a dispatch
    ///
    /// Applies only while the row is `assigning` with no assigned agents, so
    /// the assigned set is written at most once.
    async fn record_dispatch(
        &self,
        id: i64,
        status: JobRunnerStatus,
        assigned: &[i64],
        message: Option<&str>,
    ) -> StoreResult<bool>;

    /// Counts one completion event and finalizes the row on the last one
    async fn record_event(
        &self,
        id: i64,
        runner_id: Option<i64>,
        success: bool,
        message: &str,
    ) -> StoreResult<EventRecord>;

    // =========================================================================
    // Runners
    // =========================================================================

    /// Inserts or updates a runner by name and marks it online
    async fn upsert_runner(&self, req: &RegisterRunner) -> StoreResult<Runner>;

    async fn get_runner(&self, id: i64) -> StoreResult<Option<Runner>>;

    async fn find_runner_by_name(&self, name: &str) -> StoreResult<Option<Runner>>;

    async fn list_runners(&self) -> StoreResult<Vec<Runner>>;

    async fn set_runner_status(&self, id: i64, status: RunnerStatus) -> StoreResult<bool>;

    async fn set_runner_enabled(&self, id: i64, enabled: bool) -> StoreResult<bool>;

    /// Sets the soft lock
    async fn assign_runner(&self, id: i64, assignment: &RunnerAssignment) -> StoreResult<bool>;

    /// Clears the soft lock
    async fn release_runner(&self, id: i64) -> StoreResult<bool>;

    async fn delete_runner(&self, id: i64) -> StoreResult<bool>;

    // =========================================================================
    // Logs
    // =========================================================================

    async fn append_log(&self, job_runner_id: i64, line: &str) -> StoreResult<()>;

    /// Lines of one job runner in arrival order
    async fn list_logs(&self, job_runner_id: i64) -> StoreResult<Vec<LogLine>>;
}
