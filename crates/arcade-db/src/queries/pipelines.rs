//! Pipeline/job/step CRUD (C7) plus the SQL-backed readiness query used as
//! a fallback/cross-check against the in-memory DAG engine.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Job, JobStatus, Pipeline, PipelineRun, PipelineRunStatus, Step};

pub async fn insert_pipeline(
    pool: &PgPool,
    name: &str,
    definition: &serde_json::Value,
) -> Result<Pipeline> {
    sqlx::query_as::<_, Pipeline>(
        "INSERT INTO pipelines (id, name, definition) VALUES ($1, $2, $3) \
         RETURNING id, name, definition, created_at",
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(definition)
    .fetch_one(pool)
    .await
    .context("failed to insert pipeline")
}

pub async fn get_pipeline(pool: &PgPool, id: Uuid) -> Result<Option<Pipeline>> {
    sqlx::query_as::<_, Pipeline>(
        "SELECT id, name, definition, created_at FROM pipelines WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to query pipeline")
}

pub async fn insert_run(pool: &PgPool, pipeline_id: Uuid) -> Result<PipelineRun> {
    sqlx::query_as::<_, PipelineRun>(
        "INSERT INTO pipeline_runs (id, pipeline_id, status) VALUES ($1, $2, 'pending') \
         RETURNING id, pipeline_id, status, created_at, started_at, completed_at",
    )
    .bind(Uuid::new_v4())
    .bind(pipeline_id)
    .fetch_one(pool)
    .await
    .context("failed to insert pipeline run")
}

pub async fn transition_run(
    pool: &PgPool,
    run_id: Uuid,
    status: PipelineRunStatus,
) -> Result<u64> {
    let (started, completed) = match status {
        PipelineRunStatus::Running => ("now()", "NULL"),
        PipelineRunStatus::Succeeded | PipelineRunStatus::Failed | PipelineRunStatus::Cancelled => {
            ("started_at", "now()")
        }
        PipelineRunStatus::Pending => ("NULL", "NULL"),
    };
    let sql = format!(
        "UPDATE pipeline_runs SET status = $2, started_at = {started}, completed_at = {completed} \
         WHERE id = $1"
    );
    let result = sqlx::query(&sql)
        .bind(run_id)
        .bind(status)
        .execute(pool)
        .await
        .context("failed to transition pipeline run")?;
    Ok(result.rows_affected())
}

pub async fn insert_job(pool: &PgPool, run_id: Uuid, name: &str) -> Result<Job> {
    sqlx::query_as::<_, Job>(
        "INSERT INTO jobs (id, run_id, name, status) VALUES ($1, $2, $3, 'pending') \
         RETURNING id, run_id, name, status, created_at, started_at, completed_at",
    )
    .bind(Uuid::new_v4())
    .bind(run_id)
    .bind(name)
    .fetch_one(pool)
    .await
    .context("failed to insert job")
}

pub async fn insert_job_dependency(pool: &PgPool, job_id: Uuid, depends_on: Uuid) -> Result<()> {
    sqlx::query(
        "INSERT INTO job_dependencies (job_id, depends_on_job_id) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(job_id)
    .bind(depends_on)
    .execute(pool)
    .await
    .context("failed to insert job dependency")?;
    Ok(())
}

pub async fn list_jobs_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<Job>> {
    sqlx::query_as::<_, Job>(
        "SELECT id, run_id, name, status, created_at, started_at, completed_at \
         FROM jobs WHERE run_id = $1 ORDER BY created_at",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to list jobs for run")
}

/// SQL-driven readiness: jobs with no unfinished dependency, still pending.
/// Mirrors the in-memory `Dag::schedulable` computation, used as the
/// persisted cross-check after a restart.
pub async fn get_ready_jobs(pool: &PgPool, run_id: Uuid) -> Result<Vec<Job>> {
    sqlx::query_as::<_, Job>(
        "SELECT j.id, j.run_id, j.name, j.status, j.created_at, j.started_at, j.completed_at \
         FROM jobs j \
         WHERE j.run_id = $1 AND j.status = 'pending' \
           AND NOT EXISTS ( \
             SELECT 1 FROM job_dependencies jd \
             JOIN jobs dep ON dep.id = jd.depends_on_job_id \
             WHERE jd.job_id = j.id AND dep.status NOT IN ('succeeded', 'skipped') \
           )",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to query ready jobs")
}

pub async fn transition_job(pool: &PgPool, job_id: Uuid, status: JobStatus) -> Result<u64> {
    let (started, completed) = match status {
        JobStatus::Running => ("now()", "NULL"),
        JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled => {
            ("started_at", "now()")
        }
        JobStatus::Pending => ("NULL", "NULL"),
    };
    let sql = format!(
        "UPDATE jobs SET status = $2, started_at = {started}, completed_at = {completed} WHERE id = $1"
    );
    let result = sqlx::query(&sql)
        .bind(job_id)
        .bind(status)
        .execute(pool)
        .await
        .context("failed to transition job")?;
    Ok(result.rows_affected())
}

pub async fn insert_step(
    pool: &PgPool,
    job_id: Uuid,
    name: &str,
    action: &str,
    params: &serde_json::Value,
    sequence: i32,
) -> Result<Step> {
    sqlx::query_as::<_, Step>(
        "INSERT INTO steps (id, job_id, name, action, params, status, sequence) \
         VALUES ($1, $2, $3, $4, $5, 'pending', $6) \
         RETURNING id, job_id, name, action, params, status, sequence, \
                   agent_id, claimed_at, created_at, started_at, completed_at",
    )
    .bind(Uuid::new_v4())
    .bind(job_id)
    .bind(name)
    .bind(action)
    .bind(params)
    .bind(sequence)
    .fetch_one(pool)
    .await
    .context("failed to insert step")
}

pub async fn list_steps_for_job(pool: &PgPool, job_id: Uuid) -> Result<Vec<Step>> {
    sqlx::query_as::<_, Step>(
        "SELECT id, job_id, name, action, params, status, sequence, \
                agent_id, claimed_at, created_at, started_at, completed_at \
         FROM steps WHERE job_id = $1 ORDER BY sequence",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list steps for job")
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcade_test_utils::{create_test_db, drop_test_db};

    #[tokio::test]
    async fn pipeline_run_job_lifecycle() {
        let (pool, db_name) = create_test_db().await;

        let pipeline = insert_pipeline(&pool, "ci", &serde_json::json!({"jobs": ["build", "test"]}))
            .await
            .unwrap();
        let run = insert_run(&pool, pipeline.id).await.unwrap();
        assert_eq!(run.status, PipelineRunStatus::Pending);

        let build = insert_job(&pool, run.id, "build").await.unwrap();
        let test = insert_job(&pool, run.id, "test").await.unwrap();
        insert_job_dependency(&pool, test.id, build.id).await.unwrap();

        let ready = get_ready_jobs(&pool, run.id).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, build.id);

        transition_job(&pool, build.id, JobStatus::Succeeded).await.unwrap();
        let ready = get_ready_jobs(&pool, run.id).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, test.id);

        transition_run(&pool, run.id, PipelineRunStatus::Running).await.unwrap();
        let jobs = list_jobs_for_run(&pool, run.id).await.unwrap();
        assert_eq!(jobs.len(), 2);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn steps_ordered_by_sequence() {
        let (pool, db_name) = create_test_db().await;

        let pipeline = insert_pipeline(&pool, "steps-pipeline", &serde_json::json!({})).await.unwrap();
        let run = insert_run(&pool, pipeline.id).await.unwrap();
        let job = insert_job(&pool, run.id, "build").await.unwrap();

        insert_step(&pool, job.id, "checkout", "shell.command", &serde_json::json!({"cmd": "true"}), 1)
            .await
            .unwrap();
        insert_step(&pool, job.id, "compile", "shell.script", &serde_json::json!({"script": "echo"}), 0)
            .await
            .unwrap();

        let steps = list_steps_for_job(&pool, job.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name, "compile");
        assert_eq!(steps[1].name, "checkout");

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
