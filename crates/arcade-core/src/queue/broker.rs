//! Typed wrapper over `arcade-db`'s queue queries: the broker side of C4.

use anyhow::Result;
use chrono::Duration;
use sqlx::PgPool;
use uuid::Uuid;

use arcade_db::models::{QueueEntry, QueueEntryState, TaskType};
use arcade_db::queries::queue;

/// A task dispatch/priority queue backed by a Postgres table, claimed with
/// `SELECT ... FOR UPDATE SKIP LOCKED` so multiple workers never race on
/// the same entry.
#[derive(Clone)]
pub struct Broker {
    pool: PgPool,
}

impl Broker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(
        &self,
        task_id: Uuid,
        task_type: TaskType,
        queue_name: &str,
        priority: i32,
        payload: &serde_json::Value,
        max_retry: i32,
    ) -> Result<QueueEntry> {
        queue::enqueue(&self.pool, task_id, task_type, queue_name, priority, payload, max_retry).await
    }

    pub async fn claim_one(&self, queue_name: &str) -> Result<Option<QueueEntry>> {
        queue::claim_one(&self.pool, queue_name).await
    }

    pub async fn ack(&self, id: Uuid) -> Result<u64> {
        queue::ack(&self.pool, id).await
    }

    pub async fn nack(&self, id: Uuid, retry_delay: Duration) -> Result<QueueEntryState> {
        queue::nack(&self.pool, id, retry_delay).await
    }

    pub async fn depth(&self, queue_name: &str) -> Result<i64> {
        queue::queue_depth(&self.pool, queue_name).await
    }
}
