//! Runner domain model
//!
//! Represents an execution agent known to the control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job_runner::JobRunner;

/// An execution agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: i64,

    /// Unique, stable name chosen by the agent
    pub name: String,

    /// Base URL the control plane dispatches to
    pub endpoint: String,

    pub ip: Option<String>,

    /// Capability labels
    pub labels: Vec<String>,

    pub status: RunnerStatus,

    pub enabled: bool,

    /// Soft lock; `None` while the agent is free
    pub assignment: Option<RunnerAssignment>,

    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Runner {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn is_available(&self) -> bool {
        self.status == RunnerStatus::Online && self.enabled
    }

    pub fn is_busy(&self) -> bool {
        self.assignment.is_some()
    }

    /// Whether a single-agent dispatch of `job_runner` may use this agent
    ///
    /// A free agent always accepts. A busy one accepts only when it already
    /// holds the same stage and that stage runs its steps in parallel.
    pub fn accepts(&self, job_runner: &JobRunner) -> bool {
        match &self.assignment {
            None => true,
            Some(lock) => {
                lock.stage_parallel
                    && lock.stage_id.is_some()
                    && lock.stage_id == job_runner.stage_id
            }
        }
    }
}

/// Pipeline (and stage) an agent is currently working for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerAssignment {
    pub pipeline_id: i64,
    pub pipeline_name: String,
    pub stage_id: Option<i64>,
    pub stage_parallel: bool,
}

/// Reachability of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    /// Registered and reachable
    Online,

    /// A dispatch or cancel call found it unreachable
    Offline,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Online => "online",
            RunnerStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "online" => RunnerStatus::Online,
            _ => RunnerStatus::Offline,
        }
    }
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
