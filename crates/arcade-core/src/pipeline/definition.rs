//! User-authored pipeline definitions: the shape a pipeline is submitted
//! in, before [`super::compiler::compile_pipeline`] turns it into
//! persisted rows and a [`crate::dag::Dag`].

use serde::{Deserialize, Serialize};

/// A pipeline as authored by a user: a namespace, a workspace root, and an
/// ordered set of jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    pub name: String,
    pub namespace: String,
    pub workspace_root: String,
    pub jobs: Vec<JobDef>,
}

/// A job: a unique name within the pipeline, the jobs it depends on, and
/// an ordered list of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDef {
    pub name: String,
    #[serde(default)]
    pub prev_job_names: Vec<String>,
    pub steps: Vec<StepDef>,
}

/// A single step: its builtin action kind and JSON params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}
