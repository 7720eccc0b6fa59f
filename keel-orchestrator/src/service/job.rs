//! Job Service
//!
//! Launching jobs, manual step starts and re-runs, cancellation and the
//! intake of agent completion events.

use keel_core::domain::job::{Job, merge_envs};
use keel_core::domain::job_runner::{JobRunner, JobRunnerStatus};
use keel_core::domain::runner::RunnerStatus;
use keel_core::dto::event::CompletionEvent;
use keel_core::dto::job::{JobDetails, StartJob};

use super::{Result, ServiceError};
use crate::git::CommitResolver;
use crate::repository::{NewJob, NewJobRunner, Store};
use crate::scheduler::{AgentTransport, AggregatorHandle, DispatchHandle};

/// Launch a job for a pipeline
///
/// The branch head is resolved once here; every step of the job, re-runs
/// included, checks out that commit.
pub async fn launch_job(
    store: &dyn Store,
    resolver: &dyn CommitResolver,
    dispatcher: &DispatchHandle,
    pipeline_id: i64,
    req: StartJob,
) -> Result<JobDetails> {
    let pipeline = store
        .get_pipeline(pipeline_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("pipeline {}", pipeline_id)))?;

    let steps = store.list_steps(pipeline_id).await?;
    if steps.is_empty() {
        return Err(ServiceError::Validation(format!(
            "pipeline {} has no steps",
            pipeline_id
        )));
    }

    if !store.active_job_runners(pipeline_id).await?.is_empty() {
        return Err(ServiceError::Conflict(format!(
            "pipeline {} already has a job in progress",
            pipeline_id
        )));
    }

    let (commit_id, branch) = match &pipeline.git {
        Some(git) => {
            let commit = resolver.resolve(git).await?;
            tracing::info!(
                "Pipeline {} pinned to {} ({})",
                pipeline_id,
                commit,
                git.branch
            );
            (Some(commit), Some(git.branch.clone()))
        }
        None => (None, None),
    };

    let stages = store.list_stages(pipeline_id).await?;
    let job_runners = steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let parallel = step
                .stage_id
                .and_then(|id| stages.iter().find(|s| s.id == id))
                .is_some_and(|stage| stage.parallel);
            let status = if i == 0 {
                JobRunnerStatus::Queueing
            } else {
                JobRunnerStatus::Pending
            };
            NewJobRunner::for_step(step, parallel, status)
        })
        .collect();

    let (job, job_runners) = store
        .create_job(NewJob {
            pipeline_id,
            tag_template: pipeline.tag_template.clone(),
            envs: merge_envs(&pipeline.envs, &req.envs),
            commit_id,
            branch,
            job_runners,
        })
        .await?;

    tracing::info!(
        "Job {} ({}) launched for pipeline {} with {} step(s)",
        job.id,
        job.tag,
        pipeline_id,
        job_runners.len()
    );

    if let Some(first) = job_runners.first() {
        dispatcher.enqueue(first.id).await;
    }

    Ok(JobDetails { job, job_runners })
}

/// Start a step by hand
///
/// A finished step is re-run as a new row; a pending one is queued.
pub async fn start_job_runner(
    store: &dyn Store,
    dispatcher: &DispatchHandle,
    id: i64,
) -> Result<JobRunner> {
    let job_runner = get_job_runner(store, id).await?;
    let job = get_job_row(store, job_runner.job_id).await?;

    let busy = store
        .active_job_runners(job.pipeline_id)
        .await?
        .into_iter()
        .any(|other| other.id != id);
    if busy {
        return Err(ServiceError::Conflict(format!(
            "pipeline {} already has a step in progress",
            job.pipeline_id
        )));
    }

    let queued = match job_runner.status {
        status if status.is_terminal() => {
            let rerun = store.rerun_job_runner(&job_runner).await?;
            tracing::info!("Job runner {} re-run as {}", id, rerun.id);
            rerun
        }
        JobRunnerStatus::Pending => {
            if !store
                .transition_job_runner(id, JobRunnerStatus::Queueing, None)
                .await?
            {
                return Err(ServiceError::Conflict(format!(
                    "job runner {} changed status concurrently",
                    id
                )));
            }
            tracing::info!("Job runner {} started manually", id);
            get_job_runner(store, id).await?
        }
        status => {
            return Err(ServiceError::Conflict(format!(
                "job runner {} is {}",
                id, status
            )));
        }
    };

    dispatcher.enqueue(queued.id).await;

    Ok(queued)
}

/// Cancel a step execution
///
/// The record becomes `canceled` and its agents are released whether or not
/// they can be told to stop. An agent that cannot be reached is marked
/// offline and may keep running the step to completion.
pub async fn cancel_job_runner(
    store: &dyn Store,
    agents: &dyn AgentTransport,
    id: i64,
) -> Result<JobRunner> {
    let job_runner = get_job_runner(store, id).await?;
    if job_runner.status.is_terminal() {
        return Err(ServiceError::Conflict(format!(
            "job runner {} is already {}",
            id, job_runner.status
        )));
    }

    if !store
        .transition_job_runner(id, JobRunnerStatus::Canceled, Some("canceled by user"))
        .await?
    {
        return Err(ServiceError::Conflict(format!(
            "job runner {} finished before it could be canceled",
            id
        )));
    }

    let canceled = get_job_runner(store, id).await?;

    for runner_id in &canceled.assign_runner_ids {
        store.release_runner(*runner_id).await?;

        let Some(runner) = store.get_runner(*runner_id).await? else {
            continue;
        };

        match agents.cancel_job(&runner, id).await {
            Ok(()) => tracing::info!("Cancel of job runner {} sent to {}", id, runner.name),
            Err(e) if e.is_unreachable() => {
                tracing::warn!(
                    "Runner {} unreachable while canceling job runner {}: {}",
                    runner.name,
                    id,
                    e
                );
                store
                    .set_runner_status(runner.id, RunnerStatus::Offline)
                    .await?;
            }
            Err(e) => tracing::warn!(
                "Cancel of job runner {} on {} failed: {}",
                id,
                runner.name,
                e
            ),
        }
    }

    tracing::info!("Job runner {} canceled", id);

    Ok(canceled)
}

/// Hand an agent's completion event to the aggregator
pub async fn report_event(
    store: &dyn Store,
    aggregator: &AggregatorHandle,
    id: i64,
    event: CompletionEvent,
) -> Result<()> {
    get_job_runner(store, id).await?;

    tracing::debug!(
        "Event for job runner {} from runner {:?}: success={}",
        id,
        event.runner_id,
        event.success
    );
    aggregator.submit(id, event);

    Ok(())
}

/// Get a job with its step executions
pub async fn get_job(store: &dyn Store, id: i64) -> Result<JobDetails> {
    let job = get_job_row(store, id).await?;
    let job_runners = store.list_job_runners(id).await?;
    Ok(JobDetails { job, job_runners })
}

/// List jobs of a pipeline
pub async fn list_jobs(store: &dyn Store, pipeline_id: i64) -> Result<Vec<Job>> {
    if store.get_pipeline(pipeline_id).await?.is_none() {
        return Err(ServiceError::NotFound(format!("pipeline {}", pipeline_id)));
    }
    Ok(store.list_jobs(pipeline_id).await?)
}

pub async fn get_job_runner(store: &dyn Store, id: i64) -> Result<JobRunner> {
    store
        .get_job_runner(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("job runner {}", id)))
}

async fn get_job_row(store: &dyn Store, id: i64) -> Result<Job> {
    store
        .get_job(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("job {}", id)))
}
