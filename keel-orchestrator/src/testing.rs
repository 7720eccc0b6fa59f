//! Test doubles and fixtures shared by the scheduler and service tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use keel_client::ClientError;
use keel_core::domain::job::Job;
use keel_core::domain::job_runner::{JobRunner, JobRunnerStatus};
use keel_core::domain::pipeline::{GitBinding, Trigger};
use keel_core::domain::runner::Runner;
use keel_core::dto::job::ExecutionRequest;
use keel_core::dto::pipeline::{CreatePipeline, CreateStep, PipelineDetails};
use keel_core::dto::runner::RegisterRunner;

use crate::git::{CommitResolver, ResolveError};
use crate::repository::{NewJob, NewJobRunner, Store};
use crate::scheduler::transport::AgentTransport;

/// Agent transport that records calls instead of sending them
#[derive(Default)]
pub struct FakeAgents {
    unreachable: Mutex<HashSet<String>>,
    busy: Mutex<HashSet<String>>,
    started: Mutex<Vec<(String, ExecutionRequest)>>,
    cancelled: Mutex<Vec<(String, i64)>>,
}

impl FakeAgents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls to `endpoint` fail as if nothing listened there
    pub fn mark_unreachable(&self, endpoint: &str) {
        self.unreachable.lock().unwrap().insert(endpoint.to_string());
    }

    /// Starts on `endpoint` are refused as if its queue were full
    pub fn mark_busy(&self, endpoint: &str) {
        self.busy.lock().unwrap().insert(endpoint.to_string());
    }

    pub fn clear_busy(&self) {
        self.busy.lock().unwrap().clear();
    }

    pub fn started(&self) -> Vec<(String, ExecutionRequest)> {
        self.started.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<(String, i64)> {
        self.cancelled.lock().unwrap().clone()
    }

    fn check(&self, runner: &Runner) -> Result<(), ClientError> {
        if self.unreachable.lock().unwrap().contains(&runner.endpoint) {
            return Err(ClientError::api_error(404, "Not Found"));
        }
        Ok(())
    }
}

#[async_trait]
impl AgentTransport for FakeAgents {
    async fn start_job(
        &self,
        runner: &Runner,
        request: &ExecutionRequest,
    ) -> Result<(), ClientError> {
        self.check(runner)?;
        if self.busy.lock().unwrap().contains(&runner.endpoint) {
            return Err(ClientError::api_error(503, "job queue is full"));
        }
        self.started
            .lock()
            .unwrap()
            .push((runner.name.clone(), request.clone()));
        Ok(())
    }

    async fn cancel_job(&self, runner: &Runner, job_runner_id: i64) -> Result<(), ClientError> {
        self.check(runner)?;
        self.cancelled
            .lock()
            .unwrap()
            .push((runner.name.clone(), job_runner_id));
        Ok(())
    }
}

/// Resolver answering with a fixed commit and counting calls
pub struct FixedCommit {
    commit: Mutex<String>,
    calls: Mutex<u32>,
}

impl FixedCommit {
    pub fn new(commit: &str) -> Self {
        Self {
            commit: Mutex::new(commit.to_string()),
            calls: Mutex::new(0),
        }
    }

    /// Simulate a push to the remote branch
    pub fn advance(&self, commit: &str) {
        *self.commit.lock().unwrap() = commit.to_string();
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl CommitResolver for FixedCommit {
    async fn resolve(&self, _git: &GitBinding) -> Result<String, ResolveError> {
        *self.calls.lock().unwrap() += 1;
        Ok(self.commit.lock().unwrap().clone())
    }
}

/// Pipeline bound to a git repository whose steps all need `linux`
pub fn pipeline_request(name: &str, steps: &[(&str, Trigger, bool)]) -> CreatePipeline {
    CreatePipeline {
        name: name.to_string(),
        tag_template: "${COUNT}".to_string(),
        envs: BTreeMap::from([("STAGE".to_string(), "ci".to_string())]),
        git: Some(GitBinding {
            repository: "https://git.example.com/app.git".to_string(),
            branch: "main".to_string(),
            ..Default::default()
        }),
        stages: vec![],
        steps: steps
            .iter()
            .map(|(step, trigger, multiple)| CreateStep {
                name: step.to_string(),
                commands: vec![format!("echo {}", step)],
                trigger: *trigger,
                runner_label: "linux".to_string(),
                multiple_runner_exec: *multiple,
                stage: None,
            })
            .collect(),
    }
}

pub async fn simple_pipeline(
    store: &dyn Store,
    name: &str,
    steps: &[(&str, Trigger, bool)],
) -> PipelineDetails {
    store
        .create_pipeline(&pipeline_request(name, steps))
        .await
        .unwrap()
}

/// Create a job directly in the store: first step queueing, rest pending
pub async fn launch(
    store: &dyn Store,
    details: &PipelineDetails,
    commit: Option<&str>,
) -> (Job, Vec<JobRunner>) {
    let job_runners = details
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let status = if i == 0 {
                JobRunnerStatus::Queueing
            } else {
                JobRunnerStatus::Pending
            };
            NewJobRunner::for_step(step, false, status)
        })
        .collect();

    store
        .create_job(NewJob {
            pipeline_id: details.pipeline.id,
            tag_template: details.pipeline.tag_template.clone(),
            envs: details.pipeline.envs.clone(),
            commit_id: commit.map(str::to_string),
            branch: None,
            job_runners,
        })
        .await
        .unwrap()
}

pub async fn register_runner(store: &dyn Store, name: &str, labels: &[&str]) -> Runner {
    store
        .upsert_runner(&RegisterRunner {
            name: name.to_string(),
            endpoint: format!("http://{}:5913", name),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            ip: None,
        })
        .await
        .unwrap()
}
