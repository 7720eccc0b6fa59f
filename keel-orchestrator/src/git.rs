//! Remote commit resolution
//!
//! A job pins its source revision once, when it is created, by asking the
//! remote which commit the branch points at. No clone is involved.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use keel_core::domain::pipeline::GitBinding;

const LS_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git ls-remote timed out after {0:?}")]
    Timeout(Duration),

    #[error("git ls-remote exited with {code:?}: {stderr}")]
    Command { code: Option<i32>, stderr: String },

    #[error("branch '{0}' not found on remote")]
    BranchNotFound(String),
}

/// Resolves a branch to the commit it currently points at
#[async_trait]
pub trait CommitResolver: Send + Sync {
    async fn resolve(&self, git: &GitBinding) -> Result<String, ResolveError>;
}

/// [`CommitResolver`] shelling out to `git ls-remote`
#[derive(Debug, Clone, Default)]
pub struct GitCommitResolver;

#[async_trait]
impl CommitResolver for GitCommitResolver {
    async fn resolve(&self, git: &GitBinding) -> Result<String, ResolveError> {
        debug!(
            "Resolving {} at {}",
            git.branch,
            git.redacted_url()
        );

        let child = Command::new("git")
            .arg("ls-remote")
            .arg(git.authenticated_url())
            .arg(&git.branch)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(LS_REMOTE_TIMEOUT, child)
            .await
            .map_err(|_| ResolveError::Timeout(LS_REMOTE_TIMEOUT))??;

        if !output.status.success() {
            return Err(ResolveError::Command {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_ls_remote(&String::from_utf8_lossy(&output.stdout), &git.branch)
            .ok_or_else(|| ResolveError::BranchNotFound(git.branch.clone()))
    }
}

/// Picks the commit for `branch` out of `git ls-remote` output
///
/// An exact `refs/heads/<branch>` match wins over any other listed ref.
pub fn parse_ls_remote(output: &str, branch: &str) -> Option<String> {
    let head = format!("refs/heads/{}", branch);
    let refs: Vec<(&str, &str)> = output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            Some((parts.next()?, parts.next()?))
        })
        .collect();

    refs.iter()
        .find(|(_, name)| *name == head)
        .or_else(|| refs.first())
        .map(|(commit, _)| commit.to_string())
}
