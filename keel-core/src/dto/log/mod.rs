//! Log DTOs for inter-service communication

use serde::{Deserialize, Serialize};

/// Body of `POST {control}/logs/{job_runner_id}`: one line of output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendLog {
    pub log: String,
}
