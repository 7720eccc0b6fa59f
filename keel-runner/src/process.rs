//! Command runner
//!
//! Runs one shell command with `sh -c`, forwarding stdout and stderr line by
//! line to a sink while it runs. Cancellation kills the process; both
//! readers are still drained before the outcome is returned.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Output still buffered after a kill is read for at most this long
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Success,

    /// Non-zero exit; `None` when terminated by a signal
    Exited(Option<i32>),

    /// The process could not be started or waited on
    Failed(String),

    Cancelled,
}

/// Run `command` in `dir` with `envs` added to the child's environment
pub async fn run_command<F>(
    command: &str,
    dir: Option<&Path>,
    envs: &BTreeMap<String, String>,
    cancel: &CancellationToken,
    sink: F,
) -> CommandOutcome
where
    F: Fn(String),
{
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .envs(envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return CommandOutcome::Failed(format!("failed to start command: {}", e)),
    };

    debug!("Started '{}' (pid {:?})", command, child.id());

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let readers = async {
        tokio::join!(forward_lines(stdout, &sink), forward_lines(stderr, &sink));
    };
    tokio::pin!(readers);

    let cancelled = tokio::select! {
        _ = &mut readers => false,
        _ = cancel.cancelled() => true,
    };

    if cancelled {
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill '{}': {}", command, e);
        }
        let _ = child.wait().await;

        // Descendants may still hold the pipes open
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut readers)
            .await
            .is_err()
        {
            warn!("Output of '{}' not drained after kill", command);
        }
        return CommandOutcome::Cancelled;
    }

    // Output is closed; the process may still be running
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill '{}': {}", command, e);
            }
            return CommandOutcome::Cancelled;
        }
    };

    match status {
        Ok(status) if status.success() => CommandOutcome::Success,
        Ok(status) => CommandOutcome::Exited(status.code()),
        Err(e) => CommandOutcome::Failed(format!("failed to wait for command: {}", e)),
    }
}

async fn forward_lines<R, F>(stream: Option<R>, sink: &F)
where
    R: AsyncRead + Unpin,
    F: Fn(String),
{
    let Some(stream) = stream else {
        return;
    };

    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => sink(line),
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading command output: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    async fn run(
        command: &str,
        dir: Option<&Path>,
        envs: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> (CommandOutcome, Vec<String>) {
        let lines = Mutex::new(Vec::new());
        let outcome = run_command(command, dir, envs, cancel, |line| {
            lines.lock().unwrap().push(line)
        })
        .await;
        (outcome, lines.into_inner().unwrap())
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let (outcome, mut lines) = run(
            "echo out; echo err >&2",
            None,
            &BTreeMap::new(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, CommandOutcome::Success);
        lines.sort();
        assert_eq!(lines, ["err", "out"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let (outcome, _) = run("exit 3", None, &BTreeMap::new(), &CancellationToken::new()).await;
        assert_eq!(outcome, CommandOutcome::Exited(Some(3)));
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let envs = BTreeMap::from([("KEEL_TEST_VALUE".to_string(), "42".to_string())]);

        let (outcome, lines) = run(
            "cat marker.txt; echo; echo $KEEL_TEST_VALUE",
            Some(dir.path()),
            &envs,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, CommandOutcome::Success);
        assert_eq!(lines, ["here", "42"]);
        assert!(std::env::var("KEEL_TEST_VALUE").is_err());
    }

    #[tokio::test]
    async fn test_cancel_kills_running_command() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let (outcome, lines) = run(
            "echo begin; sleep 30; echo never",
            None,
            &BTreeMap::new(),
            &cancel,
        )
        .await;

        assert_eq!(outcome, CommandOutcome::Cancelled);
        assert_eq!(lines, ["begin"]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_working_dir() {
        let (outcome, _) = run(
            "true",
            Some(Path::new("/nonexistent/keel/dir")),
            &BTreeMap::new(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome, CommandOutcome::Failed(_)));
    }
}
