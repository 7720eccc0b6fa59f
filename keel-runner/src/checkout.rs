//! Source checkout
//!
//! Each pipeline gets one working copy under the workspace root, reused
//! across jobs. A missing copy is cloned from the pinned branch, an existing
//! one is fetched; either way the job's commit is then checked out
//! detached. A working copy left broken by a failed step is removed so the
//! next job starts from a fresh clone.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_core::domain::pipeline::GitBinding;

const GIT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("commit id is empty")]
    MissingCommit,

    #[error("checkout interrupted")]
    Cancelled,

    #[error("workspace error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git {action} timed out")]
    Timeout { action: &'static str },

    #[error("git {action} failed ({code:?}): {stderr}")]
    Git {
        action: &'static str,
        code: Option<i32>,
        stderr: String,
    },
}

/// Working copies kept under one root directory
#[derive(Debug, Clone)]
pub struct Checkout {
    root: PathBuf,
}

impl Checkout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Working copy directory of a pipeline
    pub fn dir_for(&self, pipeline_id: i64) -> PathBuf {
        self.root.join(format!("pipeline-{}", pipeline_id))
    }

    /// Bring the pipeline's working copy to the binding's pinned commit
    ///
    /// A cancel kills the running git process and discards the working copy.
    pub async fn prepare(
        &self,
        pipeline_id: i64,
        git: &GitBinding,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, CheckoutError> {
        let commit = git
            .commit_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(CheckoutError::MissingCommit)?;

        let dir = self.dir_for(pipeline_id);
        tokio::fs::create_dir_all(&self.root).await?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CheckoutError::Cancelled),
            result = self.sync(&dir, git, commit) => result,
        };
        if result.is_err() && tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            warn!("Removing working copy {} after failed checkout", dir.display());
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Failed to remove {}: {}", dir.display(), e);
            }
        }
        result.map(|_| dir)
    }

    async fn sync(&self, dir: &Path, git: &GitBinding, commit: &str) -> Result<(), CheckoutError> {
        let url = git.authenticated_url();

        if tokio::fs::try_exists(dir.join(".git")).await? {
            info!("Fetching {} ({}) into {}", git.redacted_url(), git.branch, dir.display());
            run_git(git, "remote set-url", dir, &["remote", "set-url", "origin", &url]).await?;
            run_git(git, "fetch", dir, &["fetch", "--quiet", "origin", &git.branch]).await?;
        } else {
            if tokio::fs::try_exists(dir).await? {
                tokio::fs::remove_dir_all(dir).await?;
            }
            info!("Cloning {} ({}) into {}", git.redacted_url(), git.branch, dir.display());
            let target = dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            run_git(
                git,
                "clone",
                &self.root,
                &["clone", "--quiet", "-b", &git.branch, "--single-branch", &url, &target],
            )
            .await?;
        }

        run_git(git, "checkout", dir, &["checkout", "--quiet", "--force", "--detach", commit]).await?;

        debug!("{} at {}", dir.display(), commit);
        Ok(())
    }
}

async fn run_git(
    git: &GitBinding,
    action: &'static str,
    cwd: &Path,
    args: &[&str],
) -> Result<(), CheckoutError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(GIT_TIMEOUT, output)
        .await
        .map_err(|_| CheckoutError::Timeout { action })??;

    if output.status.success() {
        return Ok(());
    }

    // git may echo the remote URL, credentials included
    let stderr = String::from_utf8_lossy(&output.stderr)
        .trim()
        .replace(&git.authenticated_url(), &git.redacted_url());

    Err(CheckoutError::Git {
        action,
        code: output.status.code(),
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git(dir: &Path, args: &[&str]) -> Option<String> {
        let output = StdCommand::new("git")
            .args(["-c", "user.name=keel", "-c", "user.email=keel@localhost"])
            .args(args)
            .current_dir(dir)
            .output()
            .ok()?;
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Origin repository with one commit on `main`, or `None` without git
    fn origin() -> Option<(tempfile::TempDir, String)> {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-q", "-b", "main"])?;
        std::fs::write(dir.path().join("app.txt"), "v1\n").unwrap();
        git(dir.path(), &["add", "app.txt"])?;
        git(dir.path(), &["commit", "-q", "-m", "v1"])?;
        let head = git(dir.path(), &["rev-parse", "HEAD"])?;
        Some((dir, head))
    }

    fn binding(origin: &Path, commit: &str) -> GitBinding {
        GitBinding {
            repository: origin.display().to_string(),
            branch: "main".to_string(),
            ..Default::default()
        }
        .pinned(commit)
    }

    #[tokio::test]
    async fn test_clone_then_fetch_new_commit() {
        let Some((origin, first)) = origin() else {
            eprintln!("git unavailable, skipping");
            return;
        };
        let workspace = tempfile::tempdir().unwrap();
        let checkout = Checkout::new(workspace.path());

        let dir = checkout
            .prepare(7, &binding(origin.path(), &first), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(dir, workspace.path().join("pipeline-7"));
        assert_eq!(std::fs::read_to_string(dir.join("app.txt")).unwrap(), "v1\n");

        std::fs::write(origin.path().join("app.txt"), "v2\n").unwrap();
        git(origin.path(), &["commit", "-q", "-am", "v2"]).unwrap();
        let second = git(origin.path(), &["rev-parse", "HEAD"]).unwrap();

        checkout
            .prepare(7, &binding(origin.path(), &second), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dir.join("app.txt")).unwrap(), "v2\n");
        assert_eq!(git(&dir, &["rev-parse", "HEAD"]).unwrap(), second);

        // An older pin is honoured even after the branch moved
        checkout
            .prepare(7, &binding(origin.path(), &first), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dir.join("app.txt")).unwrap(), "v1\n");
    }

    #[tokio::test]
    async fn test_unknown_commit_removes_working_copy() {
        let Some((origin, first)) = origin() else {
            eprintln!("git unavailable, skipping");
            return;
        };
        let workspace = tempfile::tempdir().unwrap();
        let checkout = Checkout::new(workspace.path());

        checkout
            .prepare(1, &binding(origin.path(), &first), &CancellationToken::new())
            .await
            .unwrap();

        let bogus = "0123456789abcdef0123456789abcdef01234567";
        let err = checkout
            .prepare(1, &binding(origin.path(), bogus), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Git { action: "checkout", .. }));
        assert!(!checkout.dir_for(1).exists());
    }

    #[tokio::test]
    async fn test_missing_commit_rejected() {
        let workspace = tempfile::tempdir().unwrap();
        let checkout = Checkout::new(workspace.path());
        let git = GitBinding {
            repository: "https://git.example.com/app.git".to_string(),
            branch: "main".to_string(),
            ..Default::default()
        };

        assert!(matches!(
            checkout.prepare(1, &git, &CancellationToken::new()).await,
            Err(CheckoutError::MissingCommit)
        ));
    }

    #[tokio::test]
    async fn test_unknown_branch_fails_clone() {
        let Some((origin, first)) = origin() else {
            eprintln!("git unavailable, skipping");
            return;
        };
        let workspace = tempfile::tempdir().unwrap();
        let checkout = Checkout::new(workspace.path());
        let mut git = binding(origin.path(), &first);
        git.branch = "release".to_string();

        let err = checkout
            .prepare(2, &git, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Git { action: "clone", .. }));
        assert!(!checkout.dir_for(2).exists());
    }

    #[tokio::test]
    async fn test_cancelled_checkout_leaves_no_working_copy() {
        let Some((origin, first)) = origin() else {
            eprintln!("git unavailable, skipping");
            return;
        };
        let workspace = tempfile::tempdir().unwrap();
        let checkout = Checkout::new(workspace.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = checkout
            .prepare(4, &binding(origin.path(), &first), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Cancelled));
        assert!(!checkout.dir_for(4).exists());
    }
}
