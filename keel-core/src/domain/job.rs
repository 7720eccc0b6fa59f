//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One invocation of a pipeline
///
/// The commit and branch are pinned once, when the job is created, so every
/// step of the job builds the identical revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub pipeline_id: i64,
    pub tag: String,
    pub envs: BTreeMap<String, String>,
    pub commit_id: Option<String>,
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Renders a tag template for a job
///
/// Supported placeholders, first match wins:
/// - `${COUNT}` - the job id
/// - `${TIMESTAMP}` - unix seconds
/// - `${DATETIME}` - `YYYYMMDDhhmmss`
///
/// A template without placeholders is used verbatim.
pub fn render_tag(template: &str, job_id: i64, now: DateTime<Utc>) -> String {
    if template.contains("${COUNT}") {
        template.replace("${COUNT}", &job_id.to_string())
    } else if template.contains("${TIMESTAMP}") {
        template.replace("${TIMESTAMP}", &now.timestamp().to_string())
    } else if template.contains("${DATETIME}") {
        template.replace("${DATETIME}", &now.format("%Y%m%d%H%M%S").to_string())
    } else {
        template.to_string()
    }
}

/// Merges pipeline default variables with per-invocation overrides
pub fn merge_envs(
    defaults: &BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = defaults.clone();
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
