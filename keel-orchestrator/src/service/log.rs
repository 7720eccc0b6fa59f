//! Log Service
//!
//! Business logic for step output lines.

use keel_core::domain::log::LogLine;

use super::{Result, ServiceError};
use crate::repository::Store;

/// Longest accepted line, in characters
pub const MAX_LINE_CHARS: usize = 10_000;

/// Append one line to a job runner's log
pub async fn append_log(store: &dyn Store, job_runner_id: i64, line: &str) -> Result<()> {
    validate_line(line)?;

    if store.get_job_runner(job_runner_id).await?.is_none() {
        return Err(ServiceError::NotFound(format!("job runner {}", job_runner_id)));
    }

    store.append_log(job_runner_id, line).await?;

    Ok(())
}

/// Lines of a job runner in arrival order
pub async fn list_logs(store: &dyn Store, job_runner_id: i64) -> Result<Vec<LogLine>> {
    if store.get_job_runner(job_runner_id).await?.is_none() {
        return Err(ServiceError::NotFound(format!("job runner {}", job_runner_id)));
    }

    Ok(store.list_logs(job_runner_id).await?)
}

fn validate_line(line: &str) -> Result<()> {
    if line.chars().count() > MAX_LINE_CHARS {
        return Err(ServiceError::Validation(format!(
            "Log line exceeds {} characters",
            MAX_LINE_CHARS
        )));
    }

    Ok(())
}
