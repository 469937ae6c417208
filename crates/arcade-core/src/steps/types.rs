use std::collections::HashMap;
use std::path::PathBuf;

/// Everything a step runner needs about where it's executing and what the
/// surrounding pipeline/job/step look like. Cheap to construct per step.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Root of the agent's local workspace for this job.
    pub workspace: PathBuf,
    /// Environment inherited from the step run plus job-level overrides.
    pub env: HashMap<String, String>,
    /// Pipeline namespace, used to lay out artifacts/reports directories.
    pub pipeline_namespace: String,
    /// Identifies which run's artifacts/reports directory to use.
    pub build_id: String,
    /// Root directory artifacts and reports are staged under, outside the
    /// workspace proper.
    pub workspace_root: PathBuf,
}

impl StepContext {
    pub fn artifacts_dir(&self) -> PathBuf {
        self.workspace_root
            .join(&self.pipeline_namespace)
            .join(&self.build_id)
            .join("artifacts")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root
            .join(&self.pipeline_namespace)
            .join(&self.build_id)
            .join("reports")
    }
}

/// Result of running a single step. `exit_code` is `-1` for non-exit
/// failures (spawn failure, timeout) rather than a process exit status.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub exit_code: i32,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn ok(stdout: String, stderr: String, duration_ms: u64, exit_code: i32) -> Self {
        Self {
            success: exit_code == 0,
            stdout,
            stderr,
            duration_ms,
            exit_code,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms,
            exit_code: -1,
            error: Some(message.into()),
        }
    }
}
