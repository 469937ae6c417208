//! Wire message shapes for the Control Plane / Agent RPC surface.
//!
//! Transport is JSON over HTTP rather than a compiled protobuf service: one
//! `POST /rpc/agent.v1.AgentService/<Method>` route per method, body and
//! response both JSON. See `DESIGN.md` for why.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub api_key: String,
    pub hostname: String,
    pub local_ip: String,
    pub os: String,
    pub arch: String,
    pub agent_version: String,
    pub max_concurrent_jobs: i32,
    #[serde(default)]
    pub installed_plugin_ids: Vec<String>,
    #[serde(default)]
    pub labels: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub agent_id: Uuid,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub agent_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub status: String,
    pub running_jobs_count: i32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub labels: Option<std::collections::HashMap<String, String>>,
    #[serde(default)]
    pub heartbeat_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchStepRunRequest {
    pub agent_id: Uuid,
    pub max_step_runs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunDescriptor {
    pub step_run_id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    pub action: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchStepRunResponse {
    pub step_runs: Vec<StepRunDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStepRunStatusRequest {
    pub agent_id: Uuid,
    pub step_run_id: Uuid,
    pub status: String,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStepRunStatusResponse {
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStepRunLogRequest {
    pub agent_id: Uuid,
    pub step_run_id: Uuid,
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStepRunLogResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelStepRunRequest {
    pub step_run_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelStepRunResponse {
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateLabelsRequest {
    pub agent_id: Uuid,
    pub labels: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub merge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateLabelsResponse {
    pub labels: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadPluginRequest {
    pub plugin_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadPluginResponse {
    pub available: bool,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListAvailablePluginsRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListAvailablePluginsResponse {
    pub plugin_ids: Vec<String>,
}

/// An envelope used for every error response, regardless of method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
}
