//! Task queue broker (C4) queries: enqueue, weighted-fair claim, ack/nack.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{QueueEntry, QueueEntryState, TaskType};

pub async fn enqueue(
    pool: &PgPool,
    task_id: Uuid,
    task_type: TaskType,
    queue_name: &str,
    priority: i32,
    payload: &serde_json::Value,
    max_retry: i32,
) -> Result<QueueEntry> {
    enqueue_delayed(
        pool, task_id, task_type, queue_name, priority, payload, max_retry, Utc::now(),
    )
    .await
}

pub async fn enqueue_delayed(
    pool: &PgPool,
    task_id: Uuid,
    task_type: TaskType,
    queue_name: &str,
    priority: i32,
    payload: &serde_json::Value,
    max_retry: i32,
    visible_at: DateTime<Utc>,
) -> Result<QueueEntry> {
    sqlx::query_as::<_, QueueEntry>(
        "INSERT INTO queue_entries \
         (id, task_id, task_type, queue_name, priority, payload, state, visible_at, max_retry) \
         VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8) \
         ON CONFLICT (task_id) DO NOTHING \
         RETURNING id, task_id, task_type, queue_name, priority, payload, state, \
                   visible_at, reserved_at, retry_count, max_retry, created_at",
    )
    .bind(Uuid::new_v4())
    .bind(task_id)
    .bind(task_type)
    .bind(queue_name)
    .bind(priority)
    .bind(payload)
    .bind(visible_at)
    .bind(max_retry)
    .fetch_one(pool)
    .await
    .context("failed to enqueue task")
}

/// Claim the highest-priority visible entry from `queue_name` using
/// `SELECT ... FOR UPDATE SKIP LOCKED`, so concurrent workers never claim the
/// same row twice.
pub async fn claim_one(pool: &PgPool, queue_name: &str) -> Result<Option<QueueEntry>> {
    let mut tx = pool.begin().await.context("failed to begin claim transaction")?;

    let row: Option<QueueEntry> = sqlx::query_as(
        "SELECT id, task_id, task_type, queue_name, priority, payload, state, \
                visible_at, reserved_at, retry_count, max_retry, created_at \
         FROM queue_entries \
         WHERE queue_name = $1 AND state = 'pending' AND visible_at <= now() \
         ORDER BY priority DESC, visible_at ASC \
         FOR UPDATE SKIP LOCKED \
         LIMIT 1",
    )
    .bind(queue_name)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to select claimable entry")?;

    let Some(entry) = row else {
        tx.commit().await.ok();
        return Ok(None);
    };

    sqlx::query("UPDATE queue_entries SET state = 'reserved', reserved_at = now() WHERE id = $1")
        .bind(entry.id)
        .execute(&mut *tx)
        .await
        .context("failed to mark entry reserved")?;

    tx.commit().await.context("failed to commit claim transaction")?;

    Ok(Some(QueueEntry {
        state: QueueEntryState::Reserved,
        ..entry
    }))
}

pub async fn ack(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE queue_entries SET state = 'completed' WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to ack queue entry")?;
    Ok(result.rows_affected())
}

/// Nack an entry: bump `retry_count`; re-queue as `pending` if under
/// `max_retry`, else archive it permanently.
pub async fn nack(pool: &PgPool, id: Uuid, retry_delay: chrono::Duration) -> Result<QueueEntryState> {
    let entry: QueueEntry = sqlx::query_as(
        "SELECT id, task_id, task_type, queue_name, priority, payload, state, \
                visible_at, reserved_at, retry_count, max_retry, created_at \
         FROM queue_entries WHERE id = $1",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .context("failed to fetch queue entry for nack")?;

    let new_state = if entry.retry_count + 1 >= entry.max_retry {
        QueueEntryState::Archived
    } else {
        QueueEntryState::Pending
    };

    sqlx::query(
        "UPDATE queue_entries \
         SET state = $2, retry_count = retry_count + 1, visible_at = $3, reserved_at = NULL \
         WHERE id = $1",
    )
    .bind(id)
    .bind(new_state)
    .bind(Utc::now() + retry_delay)
    .execute(pool)
    .await
    .context("failed to nack queue entry")?;

    Ok(new_state)
}

pub async fn get_entry(pool: &PgPool, id: Uuid) -> Result<Option<QueueEntry>> {
    sqlx::query_as::<_, QueueEntry>(
        "SELECT id, task_id, task_type, queue_name, priority, payload, state, \
                visible_at, reserved_at, retry_count, max_retry, created_at \
         FROM queue_entries WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to query queue entry")
}

pub async fn queue_depth(pool: &PgPool, queue_name: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM queue_entries WHERE queue_name = $1 AND state = 'pending'",
    )
    .bind(queue_name)
    .fetch_one(pool)
    .await
    .context("failed to count queue depth")?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcade_test_utils::{create_test_db, drop_test_db};

    #[tokio::test]
    async fn enqueue_and_claim_roundtrip() {
        let (pool, db_name) = create_test_db().await;

        let task_id = Uuid::new_v4();
        enqueue(
            &pool,
            task_id,
            TaskType::Job,
            "default",
            1,
            &serde_json::json!({"step": "build"}),
            3,
        )
        .await
        .unwrap();

        let claimed = claim_one(&pool, "default").await.unwrap().unwrap();
        assert_eq!(claimed.task_id, task_id);
        assert_eq!(claimed.state, QueueEntryState::Reserved);

        assert!(claim_one(&pool, "default").await.unwrap().is_none());

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_idempotent() {
        let (pool, db_name) = create_test_db().await;

        let task_id = Uuid::new_v4();
        enqueue(&pool, task_id, TaskType::Job, "default", 1, &serde_json::json!({}), 3)
            .await
            .unwrap();
        let second = enqueue(&pool, task_id, TaskType::Job, "default", 1, &serde_json::json!({}), 3).await;
        assert!(second.is_err(), "ON CONFLICT DO NOTHING yields no row to return");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn higher_priority_claimed_first() {
        let (pool, db_name) = create_test_db().await;

        let low = Uuid::new_v4();
        let high = Uuid::new_v4();
        enqueue(&pool, low, TaskType::Job, "q", 1, &serde_json::json!({}), 3)
            .await
            .unwrap();
        enqueue(&pool, high, TaskType::Job, "q", 9, &serde_json::json!({}), 3)
            .await
            .unwrap();

        let claimed = claim_one(&pool, "q").await.unwrap().unwrap();
        assert_eq!(claimed.task_id, high);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn nack_requeues_until_max_retry_then_archives() {
        let (pool, db_name) = create_test_db().await;

        let task_id = Uuid::new_v4();
        let entry = enqueue(&pool, task_id, TaskType::Job, "q", 1, &serde_json::json!({}), 2)
            .await
            .unwrap();
        claim_one(&pool, "q").await.unwrap();

        let state = nack(&pool, entry.id, chrono::Duration::seconds(-1)).await.unwrap();
        assert_eq!(state, QueueEntryState::Pending);

        claim_one(&pool, "q").await.unwrap();
        let state = nack(&pool, entry.id, chrono::Duration::seconds(-1)).await.unwrap();
        assert_eq!(state, QueueEntryState::Archived);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
