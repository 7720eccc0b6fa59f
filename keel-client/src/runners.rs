//! Runner registration endpoints

use crate::error::Result;
use crate::{OrchestratorClient, handle_response};
use keel_core::domain::runner::Runner;
use keel_core::dto::runner::RegisterRunner;

impl OrchestratorClient {
    /// Register (or re-register) this agent with the orchestrator
    ///
    /// Registration is an upsert keyed by name, so calling it again after a
    /// restart refreshes labels and marks the agent online.
    pub async fn register_runner(&self, request: &RegisterRunner) -> Result<Runner> {
        let url = format!("{}/register_runner", self.base_url);
        let response = self.client.post(&url).json(request).send().await?;

        handle_response(response).await
    }

    /// List all registered runners
    pub async fn list_runners(&self) -> Result<Vec<Runner>> {
        let url = format!("{}/runners", self.base_url);
        let response = self.client.get(&url).send().await?;

        handle_response(response).await
    }
}
