//! Drives a compiled pipeline run forward: enqueues each job the DAG
//! reports ready, and advances the frontier as jobs report terminal
//! status.

use std::collections::HashSet;

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use arcade_db::models::{JobStatus, PipelineRunStatus, TaskType};
use arcade_db::queries::pipelines as pipelines_db;

use crate::dag::Dag;
use crate::queue::Broker;

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub queue_name: &'static str,
    pub job_priority: i32,
    pub job_max_retry: i32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            queue_name: "default",
            job_priority: 0,
            job_max_retry: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every job completed successfully.
    Succeeded,
    /// At least one job failed; no more jobs remain runnable.
    Failed,
    /// The run has jobs still pending or in flight.
    InProgress,
}

/// Advances one [`arcade_db::models::PipelineRun`] by enqueuing ready jobs
/// and folding reported terminal statuses back into the DAG's completed
/// set.
pub struct Executor {
    pool: PgPool,
    broker: Broker,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(pool: PgPool, broker: Broker, config: ExecutorConfig) -> Self {
        Self { pool, broker, config }
    }

    /// Enqueue every job the DAG reports ready given `completed` job
    /// names, skipping jobs already enqueued this pass. Transitions the
    /// run to `Running` on first progress.
    pub async fn advance(
        &self,
        run_id: Uuid,
        dag: &Dag,
        job_ids: &std::collections::HashMap<String, Uuid>,
        completed: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let ready = dag
            .schedulable(completed, false)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        if ready.is_empty() {
            return Ok(Vec::new());
        }

        pipelines_db::transition_run(&self.pool, run_id, PipelineRunStatus::Running)
            .await
            .context("failed to mark run running")?;

        let mut enqueued = Vec::with_capacity(ready.len());
        for job_name in ready {
            let job_id = *job_ids
                .get(job_name)
                .with_context(|| format!("ready job {job_name:?} has no persisted id"))?;

            pipelines_db::transition_job(&self.pool, job_id, JobStatus::Running)
                .await
                .with_context(|| format!("failed to mark job {job_name:?} running"))?;

            self.broker
                .enqueue(
                    job_id,
                    TaskType::Job,
                    self.config.queue_name,
                    self.config.job_priority,
                    &serde_json::json!({ "run_id": run_id, "job_name": job_name }),
                    self.config.job_max_retry,
                )
                .await
                .with_context(|| format!("failed to enqueue job {job_name:?}"))?;

            enqueued.push(job_name.to_string());
        }

        Ok(enqueued)
    }

    /// Fold a job's terminal status into the run, returning the resulting
    /// outcome once the full job set has been considered against `dag`.
    pub async fn report_job_terminal(
        &self,
        run_id: Uuid,
        dag: &Dag,
        job_name: &str,
        job_id: Uuid,
        status: JobStatus,
        completed: &mut HashSet<String>,
    ) -> Result<RunOutcome> {
        pipelines_db::transition_job(&self.pool, job_id, status)
            .await
            .with_context(|| format!("failed to transition job {job_name:?} to {status}"))?;

        match status {
            JobStatus::Succeeded | JobStatus::Skipped => {
                completed.insert(job_name.to_string());
            }
            JobStatus::Failed | JobStatus::Cancelled => {
                pipelines_db::transition_run(&self.pool, run_id, PipelineRunStatus::Failed)
                    .await
                    .context("failed to mark run failed")?;
                return Ok(RunOutcome::Failed);
            }
            JobStatus::Pending | JobStatus::Running => {
                anyhow::bail!("report_job_terminal called with non-terminal status {status}");
            }
        }

        if completed.len() == dag.len() {
            pipelines_db::transition_run(&self.pool, run_id, PipelineRunStatus::Succeeded)
                .await
                .context("failed to mark run succeeded")?;
            return Ok(RunOutcome::Succeeded);
        }

        Ok(RunOutcome::InProgress)
    }
}
