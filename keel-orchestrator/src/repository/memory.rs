//! In-memory store
//!
//! Keeps every entity in mutex-guarded maps. Used for development and by the
//! scheduler and service tests. Guards are evaluated under the same lock as
//! the write they protect.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use keel_core::domain::job::{Job, render_tag};
use keel_core::domain::job_runner::{EventCounts, JobRunner, JobRunnerStatus};
use keel_core::domain::log::LogLine;
use keel_core::domain::pipeline::{Pipeline, Stage, Step, Trigger};
use keel_core::domain::runner::{Runner, RunnerAssignment, RunnerStatus};
use keel_core::dto::pipeline::{CreatePipeline, PipelineDetails};
use keel_core::dto::runner::RegisterRunner;

use super::{
    EventRecord, NewJob, Store, StoreError, StoreResult, append_message, apply_event,
    apply_transition, step_order,
};

#[derive(Default)]
struct State {
    last_id: i64,
    pipelines: BTreeMap<i64, Pipeline>,
    stages: BTreeMap<i64, Stage>,
    steps: BTreeMap<i64, Step>,
    jobs: BTreeMap<i64, Job>,
    job_runners: BTreeMap<i64, JobRunner>,
    runners: BTreeMap<i64, Runner>,
    logs: Vec<LogLine>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn sorted_steps(&self, pipeline_id: i64) -> Vec<Step> {
        let mut steps: Vec<Step> = self
            .steps
            .values()
            .filter(|s| s.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| (s.sort, s.id));
        steps
    }

    fn job_runners_of(&self, job_id: i64) -> Vec<JobRunner> {
        let mut rows: Vec<JobRunner> = self
            .job_runners
            .values()
            .filter(|jr| jr.job_id == job_id)
            .cloned()
            .collect();
        rows.sort_by_key(step_order);
        rows
    }
}

/// Store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    #[cfg(test)]
    broken_locks: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `assign_runner` fail
    #[cfg(test)]
    pub fn break_runner_locks(&self) {
        self.broken_locks.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn lock_fault(&self, id: i64) -> StoreResult<()> {
        if self.broken_locks.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt(format!("runner {} lock unavailable", id)));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn lock_fault(&self, _id: i64) -> StoreResult<()> {
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves maps consistent; keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_pipeline(&self, req: &CreatePipeline) -> StoreResult<PipelineDetails> {
        let mut state = self.lock();

        if state.pipelines.values().any(|p| p.name == req.name) {
            return Err(StoreError::Conflict(format!(
                "pipeline name '{}' already exists",
                req.name
            )));
        }

        // Resolve stage references before writing anything
        for step in &req.steps {
            if let Some(stage) = &step.stage {
                if !req.stages.iter().any(|s| &s.name == stage) {
                    return Err(StoreError::Missing(format!("stage '{}'", stage)));
                }
            }
        }

        let now = Utc::now();
        let pipeline = Pipeline {
            id: state.next_id(),
            name: req.name.clone(),
            tag_template: req.tag_template.clone(),
            envs: req.envs.clone(),
            git: req.git.clone(),
            created_at: now,
            updated_at: now,
        };
        state.pipelines.insert(pipeline.id, pipeline.clone());

        let mut stages = Vec::with_capacity(req.stages.len());
        for (sort, stage) in req.stages.iter().enumerate() {
            let stage = Stage {
                id: state.next_id(),
                pipeline_id: pipeline.id,
                name: stage.name.clone(),
                parallel: stage.parallel,
                sort: sort as i32,
            };
            state.stages.insert(stage.id, stage.clone());
            stages.push(stage);
        }

        let mut steps = Vec::with_capacity(req.steps.len());
        for (sort, step) in req.steps.iter().enumerate() {
            let stage_id = step
                .stage
                .as_ref()
                .and_then(|name| stages.iter().find(|s| &s.name == name))
                .map(|s| s.id);

            let step = Step {
                id: state.next_id(),
                pipeline_id: pipeline.id,
                stage_id,
                name: step.name.clone(),
                commands: step.commands.clone(),
                trigger: step.trigger,
                runner_label: step.runner_label.clone(),
                multiple_runner_exec: step.multiple_runner_exec,
                sort: sort as i32,
            };
            state.steps.insert(step.id, step.clone());
            steps.push(step);
        }

        Ok(PipelineDetails {
            pipeline,
            stages,
            steps,
        })
    }

    async fn get_pipeline(&self, id: i64) -> StoreResult<Option<Pipeline>> {
        Ok(self.lock().pipelines.get(&id).cloned())
    }

    async fn list_pipelines(&self) -> StoreResult<Vec<Pipeline>> {
        Ok(self.lock().pipelines.values().cloned().collect())
    }

    async fn delete_pipeline(&self, id: i64) -> StoreResult<bool> {
        let mut state = self.lock();

        if state.pipelines.remove(&id).is_none() {
            return Ok(false);
        }

        state.stages.retain(|_, s| s.pipeline_id != id);
        state.steps.retain(|_, s| s.pipeline_id != id);

        let job_ids: Vec<i64> = state
            .jobs
            .values()
            .filter(|j| j.pipeline_id == id)
            .map(|j| j.id)
            .collect();
        state.jobs.retain(|_, j| j.pipeline_id != id);

        let job_runner_ids: Vec<i64> = state
            .job_runners
            .values()
            .filter(|jr| job_ids.contains(&jr.job_id))
            .map(|jr| jr.id)
            .collect();
        state.job_runners.retain(|_, jr| !job_ids.contains(&jr.job_id));
        state
            .logs
            .retain(|l| !job_runner_ids.contains(&l.job_runner_id));

        Ok(true)
    }

    async fn list_stages(&self, pipeline_id: i64) -> StoreResult<Vec<Stage>> {
        let state = self.lock();
        let mut stages: Vec<Stage> = state
            .stages
            .values()
            .filter(|s| s.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| (s.sort, s.id));
        Ok(stages)
    }

    async fn list_steps(&self, pipeline_id: i64) -> StoreResult<Vec<Step>> {
        Ok(self.lock().sorted_steps(pipeline_id))
    }

    async fn get_step(&self, id: i64) -> StoreResult<Option<Step>> {
        Ok(self.lock().steps.get(&id).cloned())
    }

    async fn create_job(&self, new: NewJob) -> StoreResult<(Job, Vec<JobRunner>)> {
        let mut state = self.lock();

        if !state.pipelines.contains_key(&new.pipeline_id) {
            return Err(StoreError::Missing(format!("pipeline {}", new.pipeline_id)));
        }

        let now = Utc::now();
        let id = state.next_id();
        let job = Job {
            id,
            pipeline_id: new.pipeline_id,
            tag: render_tag(&new.tag_template, id, now),
            envs: new.envs,
            commit_id: new.commit_id,
            branch: new.branch,
            created_at: now,
        };
        state.jobs.insert(job.id, job.clone());

        let mut job_runners = Vec::with_capacity(new.job_runners.len());
        for row in new.job_runners {
            let job_runner = JobRunner {
                id: state.next_id(),
                job_id: job.id,
                step_id: row.step_id,
                stage_id: row.stage_id,
                parallel: row.parallel,
                step_sort: row.step_sort,
                commands: row.commands,
                trigger: row.trigger,
                status: row.status,
                event_status: EventCounts::default(),
                message: String::new(),
                assign_runner_ids: Vec::new(),
                reported_runner_ids: Vec::new(),
                start_time: None,
                end_time: None,
                created_at: now,
            };
            state.job_runners.insert(job_runner.id, job_runner.clone());
            job_runners.push(job_runner);
        }

        Ok((job, job_runners))
    }

    async fn get_job(&self, id: i64) -> StoreResult<Option<Job>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, pipeline_id: i64) -> StoreResult<Vec<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .rev()
            .filter(|j| j.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn get_job_runner(&self, id: i64) -> StoreResult<Option<JobRunner>> {
        Ok(self.lock().job_runners.get(&id).cloned())
    }

    async fn list_job_runners(&self, job_id: i64) -> StoreResult<Vec<JobRunner>> {
        Ok(self.lock().job_runners_of(job_id))
    }

    async fn active_job_runners(&self, pipeline_id: i64) -> StoreResult<Vec<JobRunner>> {
        let state = self.lock();
        Ok(state
            .job_runners
            .values()
            .filter(|jr| jr.status.is_active())
            .filter(|jr| {
                state
                    .jobs
                    .get(&jr.job_id)
                    .is_some_and(|j| j.pipeline_id == pipeline_id)
            })
            .cloned()
            .collect())
    }

    async fn queueing_job_runners(&self) -> StoreResult<Vec<JobRunner>> {
        Ok(self
            .lock()
            .job_runners
            .values()
            .filter(|jr| jr.status == JobRunnerStatus::Queueing)
            .cloned()
            .collect())
    }

    async fn next_pending_after(&self, current: &JobRunner) -> StoreResult<Option<JobRunner>> {
        let after = (current.step_sort, current.step_id);
        Ok(self
            .lock()
            .job_runners_of(current.job_id)
            .into_iter()
            .filter(|jr| jr.status == JobRunnerStatus::Pending)
            .find(|jr| (jr.step_sort, jr.step_id) > after))
    }

    async fn rerun_job_runner(&self, source: &JobRunner) -> StoreResult<JobRunner> {
        let mut state = self.lock();

        let job_runner = JobRunner {
            id: state.next_id(),
            trigger: Trigger::Manual,
            status: JobRunnerStatus::Queueing,
            event_status: EventCounts::default(),
            message: String::new(),
            assign_runner_ids: Vec::new(),
            reported_runner_ids: Vec::new(),
            start_time: None,
            end_time: None,
            created_at: Utc::now(),
            ..source.clone()
        };
        state.job_runners.insert(job_runner.id, job_runner.clone());

        Ok(job_runner)
    }

    async fn transition_job_runner(
        &self,
        id: i64,
        to: JobRunnerStatus,
        message: Option<&str>,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        Ok(match state.job_runners.get_mut(&id) {
            Some(job_runner) => apply_transition(job_runner, to, message, Utc::now()),
            None => false,
        })
    }

    async fn record_dispatch(
        &self,
        id: i64,
        status: JobRunnerStatus,
        assigned: &[i64],
        message: Option<&str>,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(job_runner) = state.job_runners.get_mut(&id) else {
            return Ok(false);
        };

        if job_runner.status != JobRunnerStatus::Assigning
            || !job_runner.assign_runner_ids.is_empty()
            || !job_runner.status.can_transition_to(status)
        {
            return Ok(false);
        }

        let now = Utc::now();
        job_runner.status = status;
        job_runner.assign_runner_ids = assigned.to_vec();
        job_runner.start_time = Some(now);
        if status.is_terminal() {
            job_runner.end_time = Some(now);
        }
        if let Some(message) = message {
            job_runner.message = append_message(&job_runner.message, message);
        }

        Ok(true)
    }

    async fn record_event(
        &self,
        id: i64,
        runner_id: Option<i64>,
        success: bool,
        message: &str,
    ) -> StoreResult<EventRecord> {
        let mut state = self.lock();
        let job_runner = state
            .job_runners
            .get_mut(&id)
            .ok_or_else(|| StoreError::Missing(format!("job runner {}", id)))?;

        Ok(apply_event(job_runner, runner_id, success, message, Utc::now()))
    }

    async fn upsert_runner(&self, req: &RegisterRunner) -> StoreResult<Runner> {
        let mut state = self.lock();
        let now = Utc::now();

        if let Some(runner) = state.runners.values_mut().find(|r| r.name == req.name) {
            runner.endpoint = req.endpoint.clone();
            runner.ip = req.ip.clone();
            runner.labels = req.labels.clone();
            runner.status = RunnerStatus::Online;
            runner.updated_at = now;
            return Ok(runner.clone());
        }

        let runner = Runner {
            id: state.next_id(),
            name: req.name.clone(),
            endpoint: req.endpoint.clone(),
            ip: req.ip.clone(),
            labels: req.labels.clone(),
            status: RunnerStatus::Online,
            enabled: true,
            assignment: None,
            registered_at: now,
            updated_at: now,
        };
        state.runners.insert(runner.id, runner.clone());

        Ok(runner)
    }

    async fn get_runner(&self, id: i64) -> StoreResult<Option<Runner>> {
        Ok(self.lock().runners.get(&id).cloned())
    }

    async fn find_runner_by_name(&self, name: &str) -> StoreResult<Option<Runner>> {
        Ok(self
            .lock()
            .runners
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn list_runners(&self) -> StoreResult<Vec<Runner>> {
        Ok(self.lock().runners.values().cloned().collect())
    }

    async fn set_runner_status(&self, id: i64, status: RunnerStatus) -> StoreResult<bool> {
        let mut state = self.lock();
        Ok(match state.runners.get_mut(&id) {
            Some(runner) => {
                runner.status = status;
                runner.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn set_runner_enabled(&self, id: i64, enabled: bool) -> StoreResult<bool> {
        let mut state = self.lock();
        Ok(match state.runners.get_mut(&id) {
            Some(runner) => {
                runner.enabled = enabled;
                runner.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn assign_runner(&self, id: i64, assignment: &RunnerAssignment) -> StoreResult<bool> {
        self.lock_fault(id)?;

        let mut state = self.lock();
        Ok(match state.runners.get_mut(&id) {
            Some(runner) => {
                runner.assignment = Some(assignment.clone());
                runner.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn release_runner(&self, id: i64) -> StoreResult<bool> {
        let mut state = self.lock();
        Ok(match state.runners.get_mut(&id) {
            Some(runner) => {
                runner.assignment = None;
                runner.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn delete_runner(&self, id: i64) -> StoreResult<bool> {
        Ok(self.lock().runners.remove(&id).is_some())
    }

    async fn append_log(&self, job_runner_id: i64, line: &str) -> StoreResult<()> {
        let mut state = self.lock();
        let id = state.next_id();
        state.logs.push(LogLine {
            id,
            job_runner_id,
            line: line.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_logs(&self, job_runner_id: i64) -> StoreResult<Vec<LogLine>> {
        Ok(self
            .lock()
            .logs
            .iter()
            .filter(|l| l.job_runner_id == job_runner_id)
            .cloned()
            .collect())
    }
}
