//! Step execution records
//!
//! A `JobRunner` is one attempt to run one step within one job. A step may
//! accumulate several rows over time (original run plus manual re-runs); the
//! latest one is the current attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::pipeline::Trigger;

/// One attempt to run a step within a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunner {
    pub id: i64,
    pub job_id: i64,
    pub step_id: i64,
    pub stage_id: Option<i64>,
    /// Whether the owning stage allows sharing an agent between its steps
    pub parallel: bool,
    pub step_sort: i32,
    pub commands: Vec<String>,
    pub trigger: Trigger,
    pub status: JobRunnerStatus,
    pub event_status: EventCounts,
    pub message: String,
    /// Agents that accepted the dispatch; written once and never grown
    pub assign_runner_ids: Vec<i64>,
    /// Agents whose completion event has already been counted
    pub reported_runner_ids: Vec<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobRunner {
    /// True once every assigned agent has reported
    pub fn all_reported(&self) -> bool {
        !self.assign_runner_ids.is_empty()
            && self.event_status.total() as usize == self.assign_runner_ids.len()
    }
}

/// Status of a step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunnerStatus {
    Pending,
    Queueing,
    Assigning,
    Running,
    PartialRunning,
    Success,
    PartialSuccess,
    Failed,
    Canceled,
}

impl JobRunnerStatus {
    pub const ALL: [JobRunnerStatus; 9] = [
        JobRunnerStatus::Pending,
        JobRunnerStatus::Queueing,
        JobRunnerStatus::Assigning,
        JobRunnerStatus::Running,
        JobRunnerStatus::PartialRunning,
        JobRunnerStatus::Success,
        JobRunnerStatus::PartialSuccess,
        JobRunnerStatus::Failed,
        JobRunnerStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunnerStatus::Pending => "pending",
            JobRunnerStatus::Queueing => "queueing",
            JobRunnerStatus::Assigning => "assigning",
            JobRunnerStatus::Running => "running",
            JobRunnerStatus::PartialRunning => "partial_running",
            JobRunnerStatus::Success => "success",
            JobRunnerStatus::PartialSuccess => "partial_success",
            JobRunnerStatus::Failed => "failed",
            JobRunnerStatus::Canceled => "canceled",
        }
    }

    /// No further transition occurs from a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobRunnerStatus::Success
                | JobRunnerStatus::PartialSuccess
                | JobRunnerStatus::Failed
                | JobRunnerStatus::Canceled
        )
    }

    /// Occupies the pipeline: queued, being assigned or executing
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobRunnerStatus::Queueing
                | JobRunnerStatus::Assigning
                | JobRunnerStatus::Running
                | JobRunnerStatus::PartialRunning
        )
    }

    /// Transition table
    pub fn can_transition_to(&self, next: JobRunnerStatus) -> bool {
        use JobRunnerStatus::*;
        match (self, next) {
            (Pending, Queueing | Canceled) => true,
            (Queueing, Assigning | Failed | Canceled) => true,
            (Assigning, Queueing | Running | PartialRunning | Failed | Canceled) => true,
            (Running | PartialRunning, Success | PartialSuccess | Failed | Canceled) => true,
            _ => false,
        }
    }

    /// Every status from which `next` may be reached
    pub fn sources_of(next: JobRunnerStatus) -> Vec<JobRunnerStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

impl std::fmt::Display for JobRunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job runner status: {0}")]
pub struct ParseStatusError(pub String);

impl std::str::FromStr for JobRunnerStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// Per-outcome completion event counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    #[serde(default)]
    pub success: u32,
    #[serde(default)]
    pub failed: u32,
}

impl EventCounts {
    pub fn record(&mut self, success: bool) {
        if success {
            self.success += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn total(&self) -> u32 {
        self.success + self.failed
    }

    /// Final status once `assigned` agents have all reported
    ///
    /// Returns `None` while reports are still outstanding.
    pub fn outcome(&self, assigned: usize) -> Option<JobRunnerStatus> {
        if assigned == 0 || self.total() as usize != assigned {
            return None;
        }

        Some(if self.success as usize == assigned {
            JobRunnerStatus::Success
        } else if self.success > 0 {
            JobRunnerStatus::PartialSuccess
        } else {
            JobRunnerStatus::Failed
        })
    }
}

/// Composite status of a fan-out dispatch
pub fn dispatch_status(sent: usize, failed: usize) -> JobRunnerStatus {
    match (sent, failed) {
        (0, _) => JobRunnerStatus::Failed,
        (_, 0) => JobRunnerStatus::Running,
        _ => JobRunnerStatus::PartialRunning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobRunnerStatus::*;

    #[test]
    fn test_terminal_states_accept_nothing() {
        for terminal in [Success, PartialSuccess, Failed, Canceled] {
            for next in JobRunnerStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(Pending.can_transition_to(Queueing));
        assert!(Queueing.can_transition_to(Assigning));
        assert!(Assigning.can_transition_to(Running));
        assert!(Assigning.can_transition_to(PartialRunning));
        assert!(Running.can_transition_to(Success));
        assert!(PartialRunning.can_transition_to(PartialSuccess));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(!Pending.can_transition_to(Running));
        assert!(!Queueing.can_transition_to(Success));
        assert!(!Running.can_transition_to(Queueing));
    }

    #[test]
    fn test_sources_of_canceled_are_non_terminal() {
        let sources = JobRunnerStatus::sources_of(Canceled);
        assert_eq!(
            sources,
            vec![Pending, Queueing, Assigning, Running, PartialRunning]
        );
    }

    #[test]
    fn test_status_string_roundtrip() {
        assert_eq!("partial_running".parse::<JobRunnerStatus>().unwrap(), PartialRunning);
        assert!("bogus".parse::<JobRunnerStatus>().is_err());
    }

    #[test]
    fn test_outcome_waits_for_all_reports() {
        let mut counts = EventCounts::default();
        counts.record(true);
        assert_eq!(counts.outcome(2), None);
        counts.record(true);
        assert_eq!(counts.outcome(2), Some(Success));
    }

    #[test]
    fn test_outcome_partial_and_failed() {
        let partial = EventCounts {
            success: 1,
            failed: 2,
        };
        assert_eq!(partial.outcome(3), Some(PartialSuccess));

        let failed = EventCounts {
            success: 0,
            failed: 2,
        };
        assert_eq!(failed.outcome(2), Some(Failed));
    }

    #[test]
    fn test_outcome_without_assignment() {
        assert_eq!(EventCounts::default().outcome(0), None);
    }

    #[test]
    fn test_dispatch_status() {
        assert_eq!(dispatch_status(0, 3), Failed);
        assert_eq!(dispatch_status(3, 0), Running);
        assert_eq!(dispatch_status(2, 1), PartialRunning);
    }

    #[test]
    fn test_event_counts_serialize_as_map() {
        let counts = EventCounts {
            success: 2,
            failed: 1,
        };
        let json = serde_json::to_value(counts).unwrap();
        assert_eq!(json, serde_json::json!({"success": 2, "failed": 1}));
    }
}
