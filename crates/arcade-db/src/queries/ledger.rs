//! Task-record ledger (C6): append-only writes, latest-row-wins reads.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{LedgerEventType, TaskQueueRecord, TaskType};

pub async fn append(
    pool: &PgPool,
    task_id: Uuid,
    task_type: TaskType,
    queue_name: &str,
    event_type: LedgerEventType,
    agent_id: Option<Uuid>,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_queue_record (task_id, task_type, queue_name, event_type, agent_id, error) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(task_id)
    .bind(task_type)
    .bind(queue_name)
    .bind(event_type)
    .bind(agent_id)
    .bind(error)
    .execute(pool)
    .await
    .context("failed to append ledger record")?;
    Ok(())
}

/// The most recently written record for a task. The latest `create_time`
/// wins; this is the ledger's "replacing" merge strategy.
pub async fn latest_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<TaskQueueRecord>> {
    sqlx::query_as::<_, TaskQueueRecord>(
        "SELECT task_id, task_type, queue_name, event_type, agent_id, error, create_time \
         FROM task_queue_record \
         WHERE task_id = $1 \
         ORDER BY create_time DESC \
         LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to query latest ledger record")
}

pub async fn history_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskQueueRecord>> {
    sqlx::query_as::<_, TaskQueueRecord>(
        "SELECT task_id, task_type, queue_name, event_type, agent_id, error, create_time \
         FROM task_queue_record \
         WHERE task_id = $1 \
         ORDER BY create_time ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to query ledger history")
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcade_test_utils::{create_test_db, drop_test_db};

    #[tokio::test]
    async fn append_and_read_latest() {
        let (pool, db_name) = create_test_db().await;

        let task_id = Uuid::new_v4();
        append(&pool, task_id, TaskType::Job, "q", LedgerEventType::Enqueued, None, None)
            .await
            .unwrap();
        append(&pool, task_id, TaskType::Job, "q", LedgerEventType::Started, None, None)
            .await
            .unwrap();

        let latest = latest_for_task(&pool, task_id).await.unwrap().unwrap();
        assert_eq!(latest.event_type, LedgerEventType::Started);

        let history = history_for_task(&pool, task_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, LedgerEventType::Enqueued);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn missing_task_has_no_latest() {
        let (pool, db_name) = create_test_db().await;

        let result = latest_for_task(&pool, Uuid::new_v4()).await.unwrap();
        assert!(result.is_none());

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
