//! Scheduler/Dispatcher
//!
//! Consumes queued job runner ids, matches capable agents and hands the step
//! to them. The queue carries ids only; every request re-reads the persisted
//! row, so duplicate or stale entries fall through the status guard.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use keel_core::domain::job::Job;
use keel_core::domain::job_runner::{JobRunner, JobRunnerStatus, dispatch_status};
use keel_core::domain::pipeline::{GitBinding, Pipeline, Step};
use keel_core::domain::runner::{Runner, RunnerAssignment, RunnerStatus};
use keel_core::dto::job::{ExecutionRequest, JobSnapshot, StepSnapshot};

use crate::repository::{Store, StoreError};
use crate::scheduler::transport::AgentTransport;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("step {0} no longer exists")]
    MissingStep(i64),

    #[error("job {0} no longer exists")]
    MissingJob(i64),

    #[error("pipeline {0} no longer exists")]
    MissingPipeline(i64),
}

/// Result of one dispatch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The row was not `queueing` (already handled or canceled)
    Skipped,

    /// No agent had capacity; a delayed retry is scheduled
    Deferred,

    /// Fan-out step with no matching agent
    NoRunner,

    /// Sent to agents; `assigned` holds the ones that accepted
    Dispatched {
        status: JobRunnerStatus,
        assigned: Vec<i64>,
    },

    /// The row changed while sends were in flight; agents were recalled
    Superseded,
}

/// Sending side of the dispatcher queue
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<i64>,
}

impl DispatchHandle {
    /// Queue a job runner for dispatch
    ///
    /// Waits while the queue is full.
    pub async fn enqueue(&self, job_runner_id: i64) {
        if self.tx.send(job_runner_id).await.is_err() {
            warn!(
                "Dispatcher stopped; job runner {} was not queued",
                job_runner_id
            );
        }
    }
}

/// Create the dispatcher queue
pub fn channel(depth: usize) -> (DispatchHandle, mpsc::Receiver<i64>) {
    let (tx, rx) = mpsc::channel(depth);
    (DispatchHandle { tx }, rx)
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    agents: Arc<dyn AgentTransport>,
    handle: DispatchHandle,
    retry_delay: Duration,
    /// Job runners with a retry timer in flight
    retries: Arc<Mutex<HashSet<i64>>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        agents: Arc<dyn AgentTransport>,
        handle: DispatchHandle,
        retry_delay: Duration,
    ) -> Self {
        Self {
            store,
            agents,
            handle,
            retry_delay,
            retries: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Worker loop; one request at a time, never exits on a request error
    pub async fn run(self, mut rx: mpsc::Receiver<i64>) {
        info!("Dispatcher started (retry delay: {:?})", self.retry_delay);

        while let Some(job_runner_id) = rx.recv().await {
            match self.dispatch(job_runner_id).await {
                Ok(outcome) => debug!("Job runner {}: {:?}", job_runner_id, outcome),
                Err(e) => {
                    error!("Dispatch of job runner {} failed: {}", job_runner_id, e);
                    self.fail(job_runner_id, &e.to_string()).await;
                }
            }
        }

        info!("Dispatcher stopped");
    }

    /// Dispatch one job runner
    pub async fn dispatch(&self, job_runner_id: i64) -> Result<DispatchOutcome, DispatchError> {
        let Some(job_runner) = self.store.get_job_runner(job_runner_id).await? else {
            warn!("Job runner {} vanished before dispatch", job_runner_id);
            return Ok(DispatchOutcome::Skipped);
        };

        if job_runner.status != JobRunnerStatus::Queueing {
            debug!(
                "Job runner {} is {}, not dispatching",
                job_runner_id, job_runner.status
            );
            return Ok(DispatchOutcome::Skipped);
        }

        let step = self
            .store
            .get_step(job_runner.step_id)
            .await?
            .ok_or(DispatchError::MissingStep(job_runner.step_id))?;
        let job = self
            .store
            .get_job(job_runner.job_id)
            .await?
            .ok_or(DispatchError::MissingJob(job_runner.job_id))?;
        let pipeline = self
            .store
            .get_pipeline(job.pipeline_id)
            .await?
            .ok_or(DispatchError::MissingPipeline(job.pipeline_id))?;

        if !self
            .store
            .transition_job_runner(job_runner_id, JobRunnerStatus::Assigning, None)
            .await?
        {
            return Ok(DispatchOutcome::Skipped);
        }

        let candidates = self.candidates(&step, &job_runner).await?;

        if candidates.is_empty() {
            return self.no_capacity(&step, job_runner_id).await;
        }

        let assignment = RunnerAssignment {
            pipeline_id: pipeline.id,
            pipeline_name: pipeline.name.clone(),
            stage_id: job_runner.stage_id,
            stage_parallel: job_runner.parallel,
        };

        let mut assigned = Vec::new();
        let mut failures = Vec::new();
        let mut busy = 0;
        let mut hard_failures = 0;

        for runner in &candidates {
            let request = execution_request(&job, &pipeline, &job_runner, runner.id);

            match self.agents.start_job(runner, &request).await {
                Ok(()) => {
                    info!(
                        "Job runner {} ({}) dispatched to {}",
                        job_runner_id, step.name, runner.name
                    );
                    // Recorded below even when the lock write fails
                    if let Err(e) = self.store.assign_runner(runner.id, &assignment).await {
                        error!("Failed to lock runner {}: {}", runner.name, e);
                    }
                    assigned.push(runner.id);

                    if !step.multiple_runner_exec {
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        "Dispatch of job runner {} to {} failed: {}",
                        job_runner_id, runner.name, e
                    );
                    if e.is_unreachable() {
                        match self
                            .store
                            .set_runner_status(runner.id, RunnerStatus::Offline)
                            .await
                        {
                            Ok(_) => warn!("Runner {} marked offline", runner.name),
                            Err(e) => error!("Failed to mark {} offline: {}", runner.name, e),
                        }
                    } else if e.is_unavailable() {
                        busy += 1;
                    } else {
                        hard_failures += 1;
                    }
                    failures.push(format!("[{}] dispatch failed: {}", runner.name, e));
                }
            }
        }

        if !step.multiple_runner_exec && assigned.is_empty() && busy > 0 && hard_failures == 0 {
            debug!(
                "Every agent for job runner {} is at capacity: {}",
                job_runner_id,
                failures.join("; ")
            );
            return self.no_capacity(&step, job_runner_id).await;
        }

        let status = if step.multiple_runner_exec {
            dispatch_status(assigned.len(), failures.len())
        } else if assigned.is_empty() {
            JobRunnerStatus::Failed
        } else {
            JobRunnerStatus::Running
        };
        let message = (!failures.is_empty()).then(|| failures.join("; "));

        let recorded = self
            .store
            .record_dispatch(job_runner_id, status, &assigned, message.as_deref())
            .await;

        match recorded {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    "Job runner {} changed while dispatching; recalling {} agent(s)",
                    job_runner_id,
                    assigned.len()
                );
                self.recall(job_runner_id, &candidates, &assigned).await;
                return Ok(DispatchOutcome::Superseded);
            }
            Err(e) => {
                self.recall(job_runner_id, &candidates, &assigned).await;
                return Err(e.into());
            }
        }

        Ok(DispatchOutcome::Dispatched { status, assigned })
    }

    /// Online, enabled agents with the step's label that have room for it
    async fn candidates(&self, step: &Step, job_runner: &JobRunner) -> Result<Vec<Runner>, StoreError> {
        Ok(self
            .store
            .list_runners()
            .await?
            .into_iter()
            .filter(|r| r.is_available() && r.has_label(&step.runner_label))
            .filter(|r| step.multiple_runner_exec || r.accepts(job_runner))
            .collect())
    }

    async fn no_capacity(
        &self,
        step: &Step,
        job_runner_id: i64,
    ) -> Result<DispatchOutcome, DispatchError> {
        if step.multiple_runner_exec {
            let message = format!("no runner available for label '{}'", step.runner_label);
            warn!("Job runner {}: {}", job_runner_id, message);
            self.store
                .transition_job_runner(job_runner_id, JobRunnerStatus::Failed, Some(&message))
                .await?;
            return Ok(DispatchOutcome::NoRunner);
        }

        debug!(
            "No free runner for label '{}'; job runner {} retries in {:?}",
            step.runner_label, job_runner_id, self.retry_delay
        );
        if self
            .store
            .transition_job_runner(job_runner_id, JobRunnerStatus::Queueing, None)
            .await?
        {
            self.schedule_retry(job_runner_id);
        }
        Ok(DispatchOutcome::Deferred)
    }

    /// Re-enqueue after the retry delay, at most one timer per job runner
    fn schedule_retry(&self, job_runner_id: i64) {
        {
            let mut pending = self
                .retries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !pending.insert(job_runner_id) {
                return;
            }
        }

        let retries = Arc::clone(&self.retries);
        let handle = self.handle.clone();
        let delay = self.retry_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            retries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&job_runner_id);
            handle.enqueue(job_runner_id).await;
        });
    }

    /// Undo sends for a job runner that was canceled mid-dispatch
    async fn recall(&self, job_runner_id: i64, candidates: &[Runner], assigned: &[i64]) {
        for runner in candidates.iter().filter(|r| assigned.contains(&r.id)) {
            if let Err(e) = self.store.release_runner(runner.id).await {
                warn!("Failed to release runner {}: {}", runner.name, e);
            }
            if let Err(e) = self.agents.cancel_job(runner, job_runner_id).await {
                warn!(
                    "Failed to recall job runner {} from {}: {}",
                    job_runner_id, runner.name, e
                );
            }
        }
    }

    /// Record a dispatch error on a job runner that has not started
    async fn fail(&self, job_runner_id: i64, message: &str) {
        let current = match self.store.get_job_runner(job_runner_id).await {
            Ok(Some(job_runner)) => job_runner.status,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to load job runner {}: {}", job_runner_id, e);
                return;
            }
        };

        if !matches!(
            current,
            JobRunnerStatus::Queueing | JobRunnerStatus::Assigning
        ) {
            return;
        }

        if let Err(e) = self
            .store
            .transition_job_runner(job_runner_id, JobRunnerStatus::Failed, Some(message))
            .await
        {
            error!(
                "Failed to mark job runner {} as failed: {}",
                job_runner_id, e
            );
        }
    }
}

/// Build the body sent to one agent
pub fn execution_request(
    job: &Job,
    pipeline: &Pipeline,
    job_runner: &JobRunner,
    runner_id: i64,
) -> ExecutionRequest {
    ExecutionRequest {
        job: JobSnapshot::from(job),
        pipeline_id: pipeline.id,
        git: pipeline.git.as_ref().map(|git| pin_to_job(git, job)),
        job_runner: StepSnapshot::from(job_runner),
        runner_id,
    }
}

/// The pipeline's binding with the branch and commit recorded on the job
fn pin_to_job(git: &GitBinding, job: &Job) -> GitBinding {
    let mut pinned = git.clone();
    if let Some(branch) = &job.branch {
        pinned.branch = branch.clone();
    }
    match &job.commit_id {
        Some(commit) => pinned.pinned(commit.clone()),
        None => pinned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;
    use crate::testing::{FakeAgents, launch, register_runner, simple_pipeline};
    use keel_core::domain::pipeline::Trigger;

    struct Fixture {
        store: Arc<MemoryStore>,
        agents: Arc<FakeAgents>,
        dispatcher: Dispatcher,
        rx: mpsc::Receiver<i64>,
    }

    fn fixture(retry_delay: Duration) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let agents = Arc::new(FakeAgents::new());
        let (handle, rx) = channel(16);
        let dispatcher = Dispatcher::new(store.clone(), agents.clone(), handle, retry_delay);
        Fixture {
            store,
            agents,
            dispatcher,
            rx,
        }
    }

    #[tokio::test]
    async fn test_single_runner_dispatch() {
        let f = fixture(Duration::from_secs(10));
        let runner = register_runner(&*f.store, "r1", &["linux"]).await;
        let pipeline = simple_pipeline(&*f.store, "app", &[("build", Trigger::Auto, false)]).await;
        let (_, job_runners) = launch(&*f.store, &pipeline, Some("abc123")).await;
        let id = job_runners[0].id;

        let outcome = f.dispatcher.dispatch(id).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                status: JobRunnerStatus::Running,
                assigned: vec![runner.id],
            }
        );

        let stored = f.store.get_job_runner(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobRunnerStatus::Running);
        assert_eq!(stored.assign_runner_ids, vec![runner.id]);
        assert!(stored.start_time.is_some());

        let locked = f.store.get_runner(runner.id).await.unwrap().unwrap();
        assert_eq!(
            locked.assignment.map(|a| a.pipeline_id),
            Some(pipeline.pipeline.id)
        );

        let started = f.agents.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].1.runner_id, runner.id);
        assert_eq!(
            started[0].1.git.as_ref().and_then(|g| g.commit_id.as_deref()),
            Some("abc123")
        );
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_dropped() {
        let f = fixture(Duration::from_secs(10));
        register_runner(&*f.store, "r1", &["linux"]).await;
        let pipeline = simple_pipeline(&*f.store, "app", &[("build", Trigger::Auto, false)]).await;
        let (_, job_runners) = launch(&*f.store, &pipeline, None).await;
        let id = job_runners[0].id;

        f.dispatcher.dispatch(id).await.unwrap();
        let again = f.dispatcher.dispatch(id).await.unwrap();

        assert_eq!(again, DispatchOutcome::Skipped);
        assert_eq!(f.agents.started().len(), 1);
    }

    #[tokio::test]
    async fn test_busy_runner_not_reused_for_single_step() {
        let f = fixture(Duration::from_secs(10));
        register_runner(&*f.store, "r1", &["linux"]).await;
        let first = simple_pipeline(&*f.store, "one", &[("build", Trigger::Auto, false)]).await;
        let second = simple_pipeline(&*f.store, "two", &[("build", Trigger::Auto, false)]).await;
        let (_, a) = launch(&*f.store, &first, None).await;
        let (_, b) = launch(&*f.store, &second, None).await;

        f.dispatcher.dispatch(a[0].id).await.unwrap();
        let outcome = f.dispatcher.dispatch(b[0].id).await.unwrap();

        assert_eq!(outcome, DispatchOutcome::Deferred);
        let stored = f.store.get_job_runner(b[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobRunnerStatus::Queueing);
    }

    #[tokio::test]
    async fn test_no_runner_defers_then_succeeds_after_registration() {
        let mut f = fixture(Duration::from_millis(20));
        let pipeline = simple_pipeline(&*f.store, "app", &[("train", Trigger::Auto, false)]).await;
        let (_, job_runners) = launch(&*f.store, &pipeline, None).await;
        let id = job_runners[0].id;

        assert_eq!(
            f.dispatcher.dispatch(id).await.unwrap(),
            DispatchOutcome::Deferred
        );

        // The retry timer re-enqueues the same id
        let retried = tokio::time::timeout(Duration::from_secs(2), f.rx.recv())
            .await
            .unwrap();
        assert_eq!(retried, Some(id));

        let runner = register_runner(&*f.store, "r1", &["linux"]).await;
        let outcome = f.dispatcher.dispatch(id).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                status: JobRunnerStatus::Running,
                assigned: vec![runner.id],
            }
        );
    }

    #[tokio::test]
    async fn test_one_retry_timer_per_job_runner() {
        let mut f = fixture(Duration::from_millis(50));
        let pipeline = simple_pipeline(&*f.store, "app", &[("build", Trigger::Auto, false)]).await;
        let (_, job_runners) = launch(&*f.store, &pipeline, None).await;
        let id = job_runners[0].id;

        f.dispatcher.dispatch(id).await.unwrap();
        f.dispatcher.dispatch(id).await.unwrap();

        assert_eq!(
            tokio::time::timeout(Duration::from_secs(2), f.rx.recv())
                .await
                .unwrap(),
            Some(id)
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(200), f.rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_fan_out_without_runners_fails_immediately() {
        let f = fixture(Duration::from_secs(10));
        let pipeline = simple_pipeline(&*f.store, "app", &[("smoke", Trigger::Auto, true)]).await;
        let (_, job_runners) = launch(&*f.store, &pipeline, None).await;
        let id = job_runners[0].id;

        assert_eq!(
            f.dispatcher.dispatch(id).await.unwrap(),
            DispatchOutcome::NoRunner
        );
        let stored = f.store.get_job_runner(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobRunnerStatus::Failed);
        assert!(stored.message.contains("no runner available"));
    }

    #[tokio::test]
    async fn test_fan_out_partial_send_failure() {
        let f = fixture(Duration::from_secs(10));
        let r1 = register_runner(&*f.store, "r1", &["linux"]).await;
        let r2 = register_runner(&*f.store, "r2", &["linux"]).await;
        let r3 = register_runner(&*f.store, "r3", &["linux"]).await;
        f.agents.mark_unreachable(&r2.endpoint);

        let pipeline = simple_pipeline(&*f.store, "app", &[("smoke", Trigger::Auto, true)]).await;
        let (_, job_runners) = launch(&*f.store, &pipeline, None).await;
        let id = job_runners[0].id;

        let outcome = f.dispatcher.dispatch(id).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                status: JobRunnerStatus::PartialRunning,
                assigned: vec![r1.id, r3.id],
            }
        );

        let offline = f.store.get_runner(r2.id).await.unwrap().unwrap();
        assert_eq!(offline.status, RunnerStatus::Offline);
        let stored = f.store.get_job_runner(id).await.unwrap().unwrap();
        assert!(stored.message.contains("[r2] dispatch failed"));
    }

    #[tokio::test]
    async fn test_fan_out_all_sends_fail() {
        let f = fixture(Duration::from_secs(10));
        let r1 = register_runner(&*f.store, "r1", &["linux"]).await;
        f.agents.mark_unreachable(&r1.endpoint);

        let pipeline = simple_pipeline(&*f.store, "app", &[("smoke", Trigger::Auto, true)]).await;
        let (_, job_runners) = launch(&*f.store, &pipeline, None).await;

        let outcome = f.dispatcher.dispatch(job_runners[0].id).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                status: JobRunnerStatus::Failed,
                assigned: vec![],
            }
        );
    }

    #[tokio::test]
    async fn test_single_step_falls_through_to_next_agent() {
        let f = fixture(Duration::from_secs(10));
        let r1 = register_runner(&*f.store, "r1", &["linux"]).await;
        let r2 = register_runner(&*f.store, "r2", &["linux"]).await;
        f.agents.mark_unreachable(&r1.endpoint);

        let pipeline = simple_pipeline(&*f.store, "app", &[("build", Trigger::Auto, false)]).await;
        let (_, job_runners) = launch(&*f.store, &pipeline, None).await;
        let id = job_runners[0].id;

        assert_eq!(
            f.dispatcher.dispatch(id).await.unwrap(),
            DispatchOutcome::Dispatched {
                status: JobRunnerStatus::Running,
                assigned: vec![r2.id],
            }
        );

        let stored = f.store.get_job_runner(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobRunnerStatus::Running);
        assert!(stored.message.contains("[r1] dispatch failed"));
        let offline = f.store.get_runner(r1.id).await.unwrap().unwrap();
        assert_eq!(offline.status, RunnerStatus::Offline);
    }

    #[tokio::test]
    async fn test_full_agent_queue_defers_single_step() {
        let mut f = fixture(Duration::from_millis(20));
        let runner = register_runner(&*f.store, "r1", &["linux"]).await;
        f.agents.mark_busy(&runner.endpoint);

        let pipeline = simple_pipeline(&*f.store, "app", &[("build", Trigger::Auto, false)]).await;
        let (_, job_runners) = launch(&*f.store, &pipeline, None).await;
        let id = job_runners[0].id;

        assert_eq!(
            f.dispatcher.dispatch(id).await.unwrap(),
            DispatchOutcome::Deferred
        );
        let stored = f.store.get_job_runner(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobRunnerStatus::Queueing);
        let online = f.store.get_runner(runner.id).await.unwrap().unwrap();
        assert_eq!(online.status, RunnerStatus::Online);

        let retried = tokio::time::timeout(Duration::from_secs(2), f.rx.recv())
            .await
            .unwrap();
        assert_eq!(retried, Some(id));

        f.agents.clear_busy();
        assert_eq!(
            f.dispatcher.dispatch(id).await.unwrap(),
            DispatchOutcome::Dispatched {
                status: JobRunnerStatus::Running,
                assigned: vec![runner.id],
            }
        );
    }

    #[tokio::test]
    async fn test_lock_write_failure_keeps_accepted_agents() {
        let f = fixture(Duration::from_secs(10));
        let r1 = register_runner(&*f.store, "r1", &["linux"]).await;
        let r2 = register_runner(&*f.store, "r2", &["linux"]).await;
        f.store.break_runner_locks();

        let pipeline = simple_pipeline(&*f.store, "app", &[("smoke", Trigger::Auto, true)]).await;
        let (_, job_runners) = launch(&*f.store, &pipeline, None).await;
        let id = job_runners[0].id;

        assert_eq!(
            f.dispatcher.dispatch(id).await.unwrap(),
            DispatchOutcome::Dispatched {
                status: JobRunnerStatus::Running,
                assigned: vec![r1.id, r2.id],
            }
        );

        let stored = f.store.get_job_runner(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobRunnerStatus::Running);
        assert_eq!(stored.assign_runner_ids, vec![r1.id, r2.id]);
        assert!(f.agents.cancelled().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_and_unlabelled_runners_skipped() {
        let f = fixture(Duration::from_secs(10));
        let disabled = register_runner(&*f.store, "r1", &["linux"]).await;
        f.store.set_runner_enabled(disabled.id, false).await.unwrap();
        register_runner(&*f.store, "r2", &["windows"]).await;

        let pipeline = simple_pipeline(&*f.store, "app", &[("build", Trigger::Auto, false)]).await;
        let (_, job_runners) = launch(&*f.store, &pipeline, None).await;

        assert_eq!(
            f.dispatcher.dispatch(job_runners[0].id).await.unwrap(),
            DispatchOutcome::Deferred
        );
        assert!(f.agents.started().is_empty());
    }

    #[tokio::test]
    async fn test_canceled_job_runner_not_dispatched() {
        let f = fixture(Duration::from_secs(10));
        register_runner(&*f.store, "r1", &["linux"]).await;
        let pipeline = simple_pipeline(&*f.store, "app", &[("build", Trigger::Auto, false)]).await;
        let (_, job_runners) = launch(&*f.store, &pipeline, None).await;
        let id = job_runners[0].id;

        f.store
            .transition_job_runner(id, JobRunnerStatus::Canceled, None)
            .await
            .unwrap();

        assert_eq!(
            f.dispatcher.dispatch(id).await.unwrap(),
            DispatchOutcome::Skipped
        );
        assert!(f.agents.started().is_empty());
    }

    #[test]
    fn test_pin_to_job_uses_job_commit() {
        let git = GitBinding {
            repository: "https://example.com/app.git".to_string(),
            branch: "main".to_string(),
            ..Default::default()
        };
        let job = Job {
            id: 1,
            pipeline_id: 1,
            tag: "1".to_string(),
            envs: Default::default(),
            commit_id: Some("deadbeef".to_string()),
            branch: Some("release".to_string()),
            created_at: chrono::Utc::now(),
        };

        let pinned = pin_to_job(&git, &job);
        assert_eq!(pinned.branch, "release");
        assert_eq!(pinned.commit_id.as_deref(), Some("deadbeef"));
    }
}
