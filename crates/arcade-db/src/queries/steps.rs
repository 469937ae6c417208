//! Step-run claiming for polling agents (backs `FetchStepRun`/
//! `ReportStepRunStatus`). Distinct from `queries::pipelines`'s step CRUD,
//! which owns insertion at compile time; this module owns the runtime
//! hand-off of individual steps to agents.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{JobStatus, Step};

const STEP_COLUMNS: &str = "id, job_id, name, action, params, status, sequence, \
                             agent_id, claimed_at, created_at, started_at, completed_at";

pub async fn get_step(pool: &PgPool, id: Uuid) -> Result<Option<Step>> {
    let sql = format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = $1");
    sqlx::query_as::<_, Step>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to query step")
}

/// Claim up to `limit` unclaimed steps belonging to running jobs, in
/// sequence order, for `agent_id`. Uses `FOR UPDATE SKIP LOCKED` so
/// concurrent agent polls never double-claim the same step.
pub async fn claim_steps_for_agent(pool: &PgPool, agent_id: Uuid, limit: i64) -> Result<Vec<Step>> {
    let mut tx = pool.begin().await.context("failed to begin step claim transaction")?;

    let select_sql = format!(
        "SELECT {STEP_COLUMNS} FROM steps s \
         JOIN jobs j ON j.id = s.job_id \
         WHERE s.status = 'pending' AND s.agent_id IS NULL AND j.status = 'running' \
         ORDER BY s.created_at, s.sequence \
         FOR UPDATE OF s SKIP LOCKED \
         LIMIT $1"
    );
    let candidates: Vec<Step> = sqlx::query_as(&select_sql)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .context("failed to select claimable steps")?;

    let mut claimed = Vec::with_capacity(candidates.len());
    for step in candidates {
        sqlx::query(
            "UPDATE steps SET agent_id = $2, claimed_at = now(), status = 'running', started_at = now() \
             WHERE id = $1",
        )
        .bind(step.id)
        .bind(agent_id)
        .execute(&mut *tx)
        .await
        .context("failed to claim step")?;

        claimed.push(Step {
            agent_id: Some(agent_id),
            status: JobStatus::Running,
            ..step
        });
    }

    tx.commit().await.context("failed to commit step claim transaction")?;
    Ok(claimed)
}

pub async fn transition_step(pool: &PgPool, step_id: Uuid, status: JobStatus) -> Result<u64> {
    let completed = matches!(
        status,
        JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
    );
    let sql = if completed {
        "UPDATE steps SET status = $2, completed_at = now() WHERE id = $1"
    } else {
        "UPDATE steps SET status = $2 WHERE id = $1"
    };
    let result = sqlx::query(sql)
        .bind(step_id)
        .bind(status)
        .execute(pool)
        .await
        .context("failed to transition step")?;
    Ok(result.rows_affected())
}

/// Release a claim without marking the step terminal, e.g. a cancellation
/// that should let a future run re-claim it from scratch.
pub async fn release_claim(pool: &PgPool, step_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE steps SET agent_id = NULL, claimed_at = NULL, status = 'pending' WHERE id = $1",
    )
    .bind(step_id)
    .execute(pool)
    .await
    .context("failed to release step claim")?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::pipelines::{insert_job, insert_pipeline, insert_run, insert_step, transition_job};
    use arcade_test_utils::{create_test_db, drop_test_db};

    #[tokio::test]
    async fn claim_skips_steps_in_non_running_jobs() {
        let (pool, db_name) = create_test_db().await;

        let pipeline = insert_pipeline(&pool, "p", &serde_json::json!({})).await.unwrap();
        let run = insert_run(&pool, pipeline.id).await.unwrap();
        let job = insert_job(&pool, run.id, "build").await.unwrap();
        insert_step(&pool, job.id, "compile", "shell_command", &serde_json::json!({}), 0)
            .await
            .unwrap();

        let agent_id = Uuid::new_v4();
        let claimed = claim_steps_for_agent(&pool, agent_id, 10).await.unwrap();
        assert!(claimed.is_empty(), "job isn't running yet, nothing claimable");

        transition_job(&pool, job.id, JobStatus::Running).await.unwrap();
        let claimed = claim_steps_for_agent(&pool, agent_id, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].agent_id, Some(agent_id));
        assert_eq!(claimed[0].status, JobStatus::Running);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn claimed_step_is_not_claimed_twice() {
        let (pool, db_name) = create_test_db().await;

        let pipeline = insert_pipeline(&pool, "p2", &serde_json::json!({})).await.unwrap();
        let run = insert_run(&pool, pipeline.id).await.unwrap();
        let job = insert_job(&pool, run.id, "build").await.unwrap();
        transition_job(&pool, job.id, JobStatus::Running).await.unwrap();
        insert_step(&pool, job.id, "compile", "shell_command", &serde_json::json!({}), 0)
            .await
            .unwrap();

        let agent_a = Uuid::new_v4();
        let agent_b = Uuid::new_v4();
        let first = claim_steps_for_agent(&pool, agent_a, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = claim_steps_for_agent(&pool, agent_b, 10).await.unwrap();
        assert!(second.is_empty());

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn transition_to_terminal_status_sets_completed_at() {
        let (pool, db_name) = create_test_db().await;

        let pipeline = insert_pipeline(&pool, "p3", &serde_json::json!({})).await.unwrap();
        let run = insert_run(&pool, pipeline.id).await.unwrap();
        let job = insert_job(&pool, run.id, "build").await.unwrap();
        let step = insert_step(&pool, job.id, "compile", "shell_command", &serde_json::json!({}), 0)
            .await
            .unwrap();

        transition_step(&pool, step.id, JobStatus::Succeeded).await.unwrap();
        let reloaded = get_step(&pool, step.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Succeeded);
        assert!(reloaded.completed_at.is_some());

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
