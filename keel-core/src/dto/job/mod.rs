//! Job DTOs for inter-service communication

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::job::Job;
use crate::domain::job_runner::JobRunner;
use crate::domain::pipeline::GitBinding;

/// Request to launch a job for a pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartJob {
    /// Overrides for the pipeline's default variables
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

/// A job together with its step executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetails {
    pub job: Job,
    pub job_runners: Vec<JobRunner>,
}

/// Body of `POST {agent}/start_job`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub job: JobSnapshot,
    pub pipeline_id: i64,
    /// Source binding, already pinned to the job's commit
    #[serde(default)]
    pub git: Option<GitBinding>,
    pub job_runner: StepSnapshot,
    /// Id the receiving agent is registered under
    pub runner_id: i64,
}

/// The parts of a job an agent needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: i64,
    pub tag: String,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        JobSnapshot {
            id: job.id,
            tag: job.tag.clone(),
            envs: job.envs.clone(),
        }
    }
}

/// The parts of a job runner an agent needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub id: i64,
    pub commands: Vec<String>,
}

impl From<&JobRunner> for StepSnapshot {
    fn from(job_runner: &JobRunner) -> Self {
        StepSnapshot {
            id: job_runner.id,
            commands: job_runner.commands.clone(),
        }
    }
}
