//! Log domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of step output, in arrival order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub id: i64,
    pub job_runner_id: i64,
    pub line: String,
    pub created_at: DateTime<Utc>,
}
