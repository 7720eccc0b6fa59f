//! Pipeline DTOs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::pipeline::{GitBinding, Pipeline, Stage, Step, Trigger};

/// Request to create a pipeline with its stages and steps
///
/// Steps keep the order they are listed in. A step joins a stage by naming
/// it in `stage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePipeline {
    pub name: String,
    #[serde(default = "default_tag_template")]
    pub tag_template: String,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub git: Option<GitBinding>,
    #[serde(default)]
    pub stages: Vec<CreateStage>,
    pub steps: Vec<CreateStep>,
}

fn default_tag_template() -> String {
    "${COUNT}".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStage {
    pub name: String,
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateStep {
    pub name: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub trigger: Trigger,
    pub runner_label: String,
    #[serde(default)]
    pub multiple_runner_exec: bool,
    #[serde(default)]
    pub stage: Option<String>,
}

/// A pipeline with its stages and ordered steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDetails {
    pub pipeline: Pipeline,
    pub stages: Vec<Stage>,
    pub steps: Vec<Step>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_pipeline_defaults() {
        let body = r#"{
            "name": "app",
            "steps": [{"name": "build", "commands": ["make"], "runner_label": "linux"}]
        }"#;
        let req: CreatePipeline = serde_json::from_str(body).unwrap();
        assert_eq!(req.tag_template, "${COUNT}");
        assert!(req.git.is_none());
        assert_eq!(req.steps[0].trigger, Trigger::Auto);
        assert!(!req.steps[0].multiple_runner_exec);
        assert!(req.steps[0].stage.is_none());
    }
}
