//! Runner DTOs
//!
//! Data transfer objects for runner-related operations.

use serde::{Deserialize, Serialize};

/// Request to register a runner with the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRunner {
    /// Stable name; re-registering under the same name updates the record
    pub name: String,

    /// Base URL the orchestrator dispatches to
    pub endpoint: String,

    /// Capability labels this runner carries
    #[serde(default)]
    pub labels: Vec<String>,

    #[serde(default)]
    pub ip: Option<String>,
}

/// Request to enable or disable a runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnableRunner {
    pub enabled: bool,
}
