//! Task record ledger (C6): a thin, timeout-guarded write path over the
//! append-only `task_queue_record` table, plus a no-op implementation for
//! callers that don't want ledger writes to block the hot path.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use arcade_db::models::{LedgerEventType, TaskType};
use arcade_db::queries::ledger as ledger_db;

/// Records task lifecycle events. Implementations must not let a slow or
/// down ledger store stall task processing -- see [`PgLedger`]'s timeout.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn record(
        &self,
        task_id: Uuid,
        task_type: TaskType,
        queue_name: &str,
        event_type: LedgerEventType,
        agent_id: Option<Uuid>,
        error: Option<&str>,
    ) -> Result<()>;
}

/// Ledger backed by Postgres, with a bounded write timeout so a slow
/// database doesn't stall the queue worker loop.
pub struct PgLedger {
    pool: PgPool,
    write_timeout: Duration,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            write_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(pool: PgPool, write_timeout: Duration) -> Self {
        Self { pool, write_timeout }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn record(
        &self,
        task_id: Uuid,
        task_type: TaskType,
        queue_name: &str,
        event_type: LedgerEventType,
        agent_id: Option<Uuid>,
        error: Option<&str>,
    ) -> Result<()> {
        tokio::time::timeout(
            self.write_timeout,
            ledger_db::append(&self.pool, task_id, task_type, queue_name, event_type, agent_id, error),
        )
        .await
        .context("ledger write timed out")?
        .context("ledger write failed")?;
        Ok(())
    }
}

/// Discards every event. Used by tests and by callers that run the queue
/// without a durable ledger.
pub struct NullLedger;

#[async_trait]
impl Ledger for NullLedger {
    async fn record(
        &self,
        _task_id: Uuid,
        _task_type: TaskType,
        _queue_name: &str,
        _event_type: LedgerEventType,
        _agent_id: Option<Uuid>,
        _error: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_ledger_always_succeeds() {
        let ledger = NullLedger;
        let result = ledger
            .record(
                Uuid::new_v4(),
                TaskType::Job,
                "default",
                LedgerEventType::Enqueued,
                None,
                None,
            )
            .await;
        assert!(result.is_ok());
    }
}
