//! Step execution
//!
//! Runs one execution request end to end: checkout, job environment, then
//! the step's commands in order. Whatever happens, the step reports exactly
//! one completion event and one closing log line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use keel_core::dto::event::CompletionEvent;
use keel_core::dto::job::ExecutionRequest;

use crate::checkout::{Checkout, CheckoutError};
use crate::process::{CommandOutcome, run_command};
use crate::service::outbox::Outbox;

const SUCCESS_LINE: &str = "This step was executed successfully.";
const INTERRUPTED: &str = "job interrupted";
const MASK: &str = "******";

/// Env keys whose values never reach the log
const SECRET_MARKERS: [&str; 5] = ["TOKEN", "SECRET", "PASSWORD", "CREDENTIAL", "KEY"];

/// How a step ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
    Interrupted,
}

/// Executes steps on behalf of one registered agent
#[derive(Debug, Clone)]
pub struct Executor {
    name: String,
    checkout: Checkout,
    outbox: Outbox,
}

impl Executor {
    pub fn new(name: impl Into<String>, checkout: Checkout, outbox: Outbox) -> Self {
        Self {
            name: name.into(),
            checkout,
            outbox,
        }
    }

    /// Log sink for a job runner, prefixed with this agent's name
    pub fn step_log(&self, job_runner_id: i64) -> StepLog<'_> {
        StepLog {
            name: &self.name,
            job_runner_id,
            outbox: &self.outbox,
        }
    }

    /// Run a request and report its outcome
    pub async fn execute(&self, req: &ExecutionRequest, cancel: &CancellationToken) -> StepOutcome {
        let log = self.step_log(req.job_runner.id);
        info!(
            "Executing job runner {} (job {}, {} command(s))",
            req.job_runner.id,
            req.job.id,
            req.job_runner.commands.len()
        );

        let outcome = self.run_step(req, cancel, &log).await;
        log.finish(&outcome, req.runner_id);

        info!("Job runner {} finished: {:?}", req.job_runner.id, outcome);
        outcome
    }

    async fn run_step(
        &self,
        req: &ExecutionRequest,
        cancel: &CancellationToken,
        log: &StepLog<'_>,
    ) -> StepOutcome {
        if cancel.is_cancelled() {
            return StepOutcome::Interrupted;
        }

        let dir = match &req.git {
            Some(git) => match self.checkout.prepare(req.pipeline_id, git, cancel).await {
                Ok(dir) => {
                    log.line(&format!(
                        "checked out {} branch {} at commit {}",
                        git.redacted_url(),
                        git.branch,
                        git.commit_id.as_deref().unwrap_or_default()
                    ));
                    Some(dir)
                }
                Err(CheckoutError::Cancelled) => return StepOutcome::Interrupted,
                Err(e) => {
                    warn!("Checkout for job runner {} failed: {}", req.job_runner.id, e);
                    return StepOutcome::Failed(e.to_string());
                }
            },
            None => None,
        };

        let env = StepEnv::new(&req.job.envs, &req.job.tag);
        for (key, value) in env.vars() {
            log.line(&format!("set env: {}={}", key, shown_value(key, value)));
        }

        for command in &req.job_runner.commands {
            if cancel.is_cancelled() {
                return StepOutcome::Interrupted;
            }

            log.line(&format!("{}$ {}", display_dir(dir.as_deref()), command));

            let outcome =
                run_command(command, dir.as_deref(), env.vars(), cancel, |line| log.line(&line))
                    .await;

            match outcome {
                CommandOutcome::Success => {}
                CommandOutcome::Exited(code) => {
                    let code = code.map_or_else(|| "killed by signal".to_string(), |c| c.to_string());
                    return StepOutcome::Failed(format!("exit code: {}", code));
                }
                CommandOutcome::Failed(message) => return StepOutcome::Failed(message),
                CommandOutcome::Cancelled => return StepOutcome::Interrupted,
            }
        }

        StepOutcome::Succeeded
    }
}

/// Variables every command of one execution sees
///
/// They are handed to each child process and never written into the
/// agent's own environment, so nothing outlives the execution.
#[derive(Debug, Clone)]
pub struct StepEnv {
    vars: BTreeMap<String, String>,
}

impl StepEnv {
    pub fn new(job_envs: &BTreeMap<String, String>, tag: &str) -> Self {
        let mut vars = job_envs.clone();
        vars.insert("VERSION".to_string(), tag.to_string());
        Self { vars }
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

/// Log and event output of one job runner
pub struct StepLog<'a> {
    name: &'a str,
    job_runner_id: i64,
    outbox: &'a Outbox,
}

impl StepLog<'_> {
    /// Queue one log line, stamped with local time and the agent name
    pub fn line(&self, message: &str) {
        let line = format!(
            "{} [{}] {}",
            Local::now().format("%Y/%m/%d %H:%M:%S"),
            self.name,
            message
        );
        self.outbox.log(self.job_runner_id, line);
    }

    /// The single completion event and closing line of an execution
    pub fn finish(self, outcome: &StepOutcome, runner_id: i64) {
        let (success, message, last_line) = match outcome {
            StepOutcome::Succeeded => (true, String::new(), SUCCESS_LINE.to_string()),
            StepOutcome::Failed(message) => (false, self.tagged(message), message.clone()),
            StepOutcome::Interrupted => (false, self.tagged(INTERRUPTED), INTERRUPTED.to_string()),
        };

        self.outbox.event(
            self.job_runner_id,
            CompletionEvent {
                success,
                message,
                runner_id: Some(runner_id),
            },
        );
        self.line(&last_line);
    }

    fn tagged(&self, message: &str) -> String {
        format!("[{}] {}", self.name, message)
    }
}

fn shown_value<'a>(key: &str, value: &'a str) -> &'a str {
    let key = key.to_ascii_uppercase();
    if SECRET_MARKERS.iter().any(|marker| key.contains(marker)) {
        MASK
    } else {
        value
    }
}

fn display_dir(dir: Option<&Path>) -> String {
    dir.map(Path::display)
        .map(|d| d.to_string())
        .unwrap_or_else(|| "~".to_string())
}

/// Checkout root resolved against the agent's working directory
pub fn workspace_root(dir: &Path) -> PathBuf {
    std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use keel_core::dto::job::{JobSnapshot, StepSnapshot};

    use crate::service::outbox::OutboxConfig;
    use crate::service::outbox::tests::{RecordingTransport, eventually};

    struct Fixture {
        transport: Arc<RecordingTransport>,
        executor: Executor,
        _workspace: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(RecordingTransport::default());
        let outbox = Outbox::start(
            transport.clone(),
            OutboxConfig {
                capacity: 256,
                event_attempts: 1,
                backoff: Duration::from_millis(1),
            },
        );
        let workspace = tempfile::tempdir().unwrap();
        Fixture {
            executor: Executor::new("r1", Checkout::new(workspace.path()), outbox),
            transport,
            _workspace: workspace,
        }
    }

    fn request(commands: &[&str]) -> ExecutionRequest {
        ExecutionRequest {
            job: JobSnapshot {
                id: 1,
                tag: "1.0.7".to_string(),
                envs: BTreeMap::from([("STAGE".to_string(), "ci".to_string())]),
            },
            pipeline_id: 3,
            git: None,
            job_runner: StepSnapshot {
                id: 11,
                commands: commands.iter().map(|c| c.to_string()).collect(),
            },
            runner_id: 5,
        }
    }

    impl Fixture {
        async fn settle(&self) -> (CompletionEvent, Vec<String>) {
            assert!(eventually(|| !self.transport.events().is_empty()).await);
            // The closing line is queued right after the event
            tokio::time::sleep(Duration::from_millis(100)).await;

            let events = self.transport.events();
            assert_eq!(events.len(), 1, "exactly one completion event");
            let lines = self
                .transport
                .logs()
                .into_iter()
                .map(|(_, line)| line)
                .collect();
            (events[0].1.clone(), lines)
        }
    }

    #[tokio::test]
    async fn test_successful_step() {
        let f = fixture();
        let outcome = f
            .executor
            .execute(&request(&["echo $STAGE-$VERSION"]), &CancellationToken::new())
            .await;
        assert_eq!(outcome, StepOutcome::Succeeded);

        let (event, lines) = f.settle().await;
        assert!(event.success);
        assert_eq!(event.message, "");
        assert_eq!(event.runner_id, Some(5));

        assert!(lines.iter().any(|l| l.ends_with("[r1] ~$ echo $STAGE-$VERSION")));
        assert!(lines.iter().any(|l| l.ends_with("[r1] ci-1.0.7")));
        assert!(lines.last().unwrap().ends_with(SUCCESS_LINE));
        assert!(std::env::var("VERSION").map_or(true, |v| v != "1.0.7"));
    }

    #[tokio::test]
    async fn test_failing_command_stops_sequence() {
        let f = fixture();
        let outcome = f
            .executor
            .execute(
                &request(&["echo one", "exit 4", "echo three"]),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, StepOutcome::Failed("exit code: 4".to_string()));

        let (event, lines) = f.settle().await;
        assert!(!event.success);
        assert_eq!(event.message, "[r1] exit code: 4");
        assert!(!lines.iter().any(|l| l.ends_with("three")));
        assert!(lines.last().unwrap().ends_with("exit code: 4"));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = f.executor.execute(&request(&["echo hi"]), &cancel).await;
        assert_eq!(outcome, StepOutcome::Interrupted);

        let (event, lines) = f.settle().await;
        assert_eq!(event.message, "[r1] job interrupted");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("job interrupted"));
    }

    #[tokio::test]
    async fn test_cancel_mid_command() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let outcome = f
            .executor
            .execute(&request(&["sleep 30", "echo after"]), &cancel)
            .await;
        assert_eq!(outcome, StepOutcome::Interrupted);

        let (event, lines) = f.settle().await;
        assert!(!event.success);
        assert!(!lines.iter().any(|l| l.ends_with("after")));
    }

    #[tokio::test]
    async fn test_checkout_failure_reported() {
        let f = fixture();
        let mut req = request(&["echo never"]);
        req.git = Some(keel_core::domain::pipeline::GitBinding {
            repository: "https://git.example.com/app.git".to_string(),
            branch: "main".to_string(),
            ..Default::default()
        });

        let outcome = f.executor.execute(&req, &CancellationToken::new()).await;
        assert_eq!(outcome, StepOutcome::Failed("commit id is empty".to_string()));

        let (event, _) = f.settle().await;
        assert_eq!(event.message, "[r1] commit id is empty");
    }

    #[tokio::test]
    async fn test_secret_env_values_masked_in_log() {
        let f = fixture();
        let mut req = request(&["true"]);
        req.job
            .envs
            .insert("deploy_token".to_string(), "s3cr3t-value".to_string());

        f.executor.execute(&req, &CancellationToken::new()).await;

        let (_, lines) = f.settle().await;
        assert!(lines.iter().any(|l| l.ends_with("set env: deploy_token=******")));
        assert!(lines.iter().any(|l| l.ends_with("set env: STAGE=ci")));
        assert!(!lines.iter().any(|l| l.contains("s3cr3t-value")));
    }

    #[test]
    fn test_step_env_injects_version() {
        let envs = BTreeMap::from([("VERSION".to_string(), "old".to_string())]);
        let env = StepEnv::new(&envs, "2.0");
        assert_eq!(env.vars().get("VERSION").map(String::as_str), Some("2.0"));
    }
}
