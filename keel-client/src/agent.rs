//! Orchestrator to agent calls

use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::error::Result;
use crate::{handle_empty_response, trim_base_url};
use keel_core::dto::job::ExecutionRequest;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for execution agents
///
/// Unlike [`crate::OrchestratorClient`] this is not bound to one base URL:
/// every call names the agent endpoint it targets.
#[derive(Debug, Clone)]
pub struct AgentClient {
    client: Client,
    timeout: Duration,
}

impl Default for AgentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentClient {
    pub fn new() -> Self {
        Self::with_client(Client::new(), DEFAULT_TIMEOUT)
    }

    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Hand a step execution to the agent at `endpoint`
    ///
    /// Success only means the agent queued the request.
    pub async fn start_job(&self, endpoint: &str, request: &ExecutionRequest) -> Result<()> {
        let url = format!("{}/start_job", trim_base_url(endpoint.to_string()));
        debug!("Dispatching job runner {} to {}", request.job_runner.id, url);

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;

        handle_empty_response(response).await
    }

    /// Ask the agent at `endpoint` to interrupt a step execution
    pub async fn cancel_job(&self, endpoint: &str, job_runner_id: i64) -> Result<()> {
        let url = format!(
            "{}/cancel_job/{}",
            trim_base_url(endpoint.to_string()),
            job_runner_id
        );
        debug!("Cancelling job runner {} at {}", job_runner_id, url);

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .send()
            .await?;

        handle_empty_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn closed_port_endpoint() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}/", port)
    }

    #[tokio::test]
    async fn test_cancel_against_closed_port_is_unreachable() {
        let endpoint = closed_port_endpoint().await;
        let err = AgentClient::new().cancel_job(&endpoint, 1).await.unwrap_err();
        assert!(err.is_unreachable(), "unexpected error: {err}");
    }
}
