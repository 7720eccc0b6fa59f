//! Control plane to agent calls

use async_trait::async_trait;

use keel_client::{AgentClient, ClientError};
use keel_core::domain::runner::Runner;
use keel_core::dto::job::ExecutionRequest;

/// How the dispatcher and the cancel path reach execution agents
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn start_job(&self, runner: &Runner, request: &ExecutionRequest)
    -> Result<(), ClientError>;

    async fn cancel_job(&self, runner: &Runner, job_runner_id: i64) -> Result<(), ClientError>;
}

/// [`AgentTransport`] over HTTP
#[derive(Debug, Clone, Default)]
pub struct HttpAgentTransport {
    client: AgentClient,
}

impl HttpAgentTransport {
    pub fn new(client: AgentClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn start_job(
        &self,
        runner: &Runner,
        request: &ExecutionRequest,
    ) -> Result<(), ClientError> {
        self.client.start_job(&runner.endpoint, request).await
    }

    async fn cancel_job(&self, runner: &Runner, job_runner_id: i64) -> Result<(), ClientError> {
        self.client.cancel_job(&runner.endpoint, job_runner_id).await
    }
}
