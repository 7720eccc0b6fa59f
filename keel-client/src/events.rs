//! Completion event and log delivery

use crate::error::Result;
use crate::{OrchestratorClient, handle_empty_response};
use keel_core::dto::event::CompletionEvent;
use keel_core::dto::log::AppendLog;

impl OrchestratorClient {
    /// Report the outcome of a step execution
    pub async fn send_event(&self, job_runner_id: i64, event: &CompletionEvent) -> Result<()> {
        let url = format!("{}/events/{}", self.base_url, job_runner_id);
        let response = self.client.post(&url).json(event).send().await?;

        handle_empty_response(response).await
    }

    /// Append one line to a step's log
    pub async fn send_log(&self, job_runner_id: i64, line: &str) -> Result<()> {
        let url = format!("{}/logs/{}", self.base_url, job_runner_id);
        let response = self
            .client
            .post(&url)
            .json(&AppendLog {
                log: line.to_string(),
            })
            .send()
            .await?;

        handle_empty_response(response).await
    }
}
