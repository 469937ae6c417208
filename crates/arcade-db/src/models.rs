//! Row types and enums backing the Postgres schema.
//!
//! Enums are stored as `text` columns (not native Postgres enums) so that
//! adding a variant never requires an `ALTER TYPE` migration. Each enum gets
//! a hand-written `Display`/`FromStr` pair instead of relying on `sqlx`'s
//! derive alone, so the same string representation is usable outside SQL
//! (JSON payloads, CLI flags, log fields).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// AgentState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Registered,
    Online,
    Offline,
    Draining,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Registered => "registered",
            AgentState::Online => "online",
            AgentState::Offline => "offline",
            AgentState::Draining => "draining",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStateParseError(pub String);

impl fmt::Display for AgentStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent state: {:?}", self.0)
    }
}
impl std::error::Error for AgentStateParseError {}

impl FromStr for AgentState {
    type Err = AgentStateParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(AgentState::Registered),
            "online" => Ok(AgentState::Online),
            "offline" => Ok(AgentState::Offline),
            "draining" => Ok(AgentState::Draining),
            other => Err(AgentStateParseError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Pipeline,
    Job,
    Step,
    Custom,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskType::Pipeline => "pipeline",
            TaskType::Job => "job",
            TaskType::Step => "step",
            TaskType::Custom => "custom",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}
impl std::error::Error for TaskTypeParseError {}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pipeline" => Ok(TaskType::Pipeline),
            "job" => Ok(TaskType::Job),
            "step" => Ok(TaskType::Step),
            "custom" => Ok(TaskType::Custom),
            other => Err(TaskTypeParseError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// QueueEntryState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryState {
    Pending,
    Reserved,
    Completed,
    Failed,
    Archived,
}

impl fmt::Display for QueueEntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueEntryState::Pending => "pending",
            QueueEntryState::Reserved => "reserved",
            QueueEntryState::Completed => "completed",
            QueueEntryState::Failed => "failed",
            QueueEntryState::Archived => "archived",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntryStateParseError(pub String);

impl fmt::Display for QueueEntryStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid queue entry state: {:?}", self.0)
    }
}
impl std::error::Error for QueueEntryStateParseError {}

impl FromStr for QueueEntryState {
    type Err = QueueEntryStateParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueEntryState::Pending),
            "reserved" => Ok(QueueEntryState::Reserved),
            "completed" => Ok(QueueEntryState::Completed),
            "failed" => Ok(QueueEntryState::Failed),
            "archived" => Ok(QueueEntryState::Archived),
            other => Err(QueueEntryStateParseError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineRunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PipelineRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for PipelineRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineRunStatus::Pending => "pending",
            PipelineRunStatus::Running => "running",
            PipelineRunStatus::Succeeded => "succeeded",
            PipelineRunStatus::Failed => "failed",
            PipelineRunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRunStatusParseError(pub String);

impl fmt::Display for PipelineRunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pipeline run status: {:?}", self.0)
    }
}
impl std::error::Error for PipelineRunStatusParseError {}

impl FromStr for PipelineRunStatus {
    type Err = PipelineRunStatusParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PipelineRunStatus::Pending),
            "running" => Ok(PipelineRunStatus::Running),
            "succeeded" => Ok(PipelineRunStatus::Succeeded),
            "failed" => Ok(PipelineRunStatus::Failed),
            "cancelled" => Ok(PipelineRunStatus::Cancelled),
            other => Err(PipelineRunStatusParseError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus (also used for steps)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}
impl std::error::Error for JobStatusParseError {}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "skipped" => Ok(JobStatus::Skipped),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(JobStatusParseError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// LedgerEventType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventType {
    Enqueued,
    Started,
    Completed,
    Failed,
}

impl fmt::Display for LedgerEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LedgerEventType::Enqueued => "enqueued",
            LedgerEventType::Started => "started",
            LedgerEventType::Completed => "completed",
            LedgerEventType::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEventTypeParseError(pub String);

impl fmt::Display for LedgerEventTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid ledger event type: {:?}", self.0)
    }
}
impl std::error::Error for LedgerEventTypeParseError {}

impl FromStr for LedgerEventType {
    type Err = LedgerEventTypeParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(LedgerEventType::Enqueued),
            "started" => Ok(LedgerEventType::Started),
            "completed" => Ok(LedgerEventType::Completed),
            "failed" => Ok(LedgerEventType::Failed),
            other => Err(LedgerEventTypeParseError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A registered Agent, as tracked by the Control Plane.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub labels: serde_json::Value,
    pub state: AgentState,
    pub max_concurrency: i32,
    pub running_jobs_count: i32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

/// An entry in the persistent task queue (C4/C5).
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub queue_name: String,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub state: QueueEntryState,
    pub visible_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retry: i32,
    pub created_at: DateTime<Utc>,
}

/// A row in the columnar task-record ledger (C6). Append-mostly, never the
/// source of truth for scheduling -- only for observability/analytics.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct TaskQueueRecord {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub queue_name: String,
    pub event_type: LedgerEventType,
    pub agent_id: Option<Uuid>,
    pub error: Option<String>,
    pub create_time: DateTime<Utc>,
}

/// A pipeline definition (compiled DAG template).
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One execution of a [`Pipeline`].
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub status: PipelineRunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A job (DAG node) within a [`PipelineRun`].
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A directed edge `job_id depends_on depends_on_job_id`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct JobDependency {
    pub job_id: Uuid,
    pub depends_on_job_id: Uuid,
}

/// A single step within a job, executed by an `arcade-core` step runner.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    pub action: String,
    pub params: serde_json::Value,
    pub status: JobStatus,
    pub sequence: i32,
    pub agent_id: Option<Uuid>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! roundtrip_test {
        ($name:ident, $ty:ty, $variant:expr, $text:expr) => {
            #[test]
            fn $name() {
                let v: $ty = $variant;
                assert_eq!(v.to_string(), $text);
                let parsed: $ty = $text.parse().unwrap();
                assert_eq!(parsed, v);
            }
        };
    }

    roundtrip_test!(agent_state_online_roundtrip, AgentState, AgentState::Online, "online");
    roundtrip_test!(task_type_job_roundtrip, TaskType, TaskType::Job, "job");
    roundtrip_test!(
        queue_state_reserved_roundtrip,
        QueueEntryState,
        QueueEntryState::Reserved,
        "reserved"
    );
    roundtrip_test!(
        run_status_running_roundtrip,
        PipelineRunStatus,
        PipelineRunStatus::Running,
        "running"
    );
    roundtrip_test!(job_status_failed_roundtrip, JobStatus, JobStatus::Failed, "failed");
    roundtrip_test!(
        ledger_event_completed_roundtrip,
        LedgerEventType,
        LedgerEventType::Completed,
        "completed"
    );

    #[test]
    fn agent_state_rejects_invalid() {
        assert!("bogus".parse::<AgentState>().is_err());
    }

    #[test]
    fn task_type_rejects_invalid() {
        assert!("bogus".parse::<TaskType>().is_err());
    }

    #[test]
    fn queue_state_rejects_invalid() {
        assert!("bogus".parse::<QueueEntryState>().is_err());
    }

    #[test]
    fn run_status_rejects_invalid() {
        assert!("bogus".parse::<PipelineRunStatus>().is_err());
    }

    #[test]
    fn job_status_rejects_invalid() {
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn ledger_event_rejects_invalid() {
        assert!("bogus".parse::<LedgerEventType>().is_err());
    }
}
