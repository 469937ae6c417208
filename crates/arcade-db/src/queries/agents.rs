use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Agent, AgentState};

pub async fn register_agent(
    pool: &PgPool,
    id: Uuid,
    name: &str,
    labels: &serde_json::Value,
    max_concurrency: i32,
) -> Result<Agent> {
    sqlx::query_as::<_, Agent>(
        "INSERT INTO agents (id, name, labels, state, max_concurrency, registered_at) \
         VALUES ($1, $2, $3, 'registered', $4, $5) \
         ON CONFLICT (name) DO UPDATE SET labels = EXCLUDED.labels \
         RETURNING id, name, labels, state, max_concurrency, running_jobs_count, \
                   last_heartbeat_at, registered_at",
    )
    .bind(id)
    .bind(name)
    .bind(labels)
    .bind(max_concurrency)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to register agent")
}

pub async fn get_agent(pool: &PgPool, id: Uuid) -> Result<Option<Agent>> {
    sqlx::query_as::<_, Agent>(
        "SELECT id, name, labels, state, max_concurrency, running_jobs_count, \
                last_heartbeat_at, registered_at \
         FROM agents WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to query agent")
}

pub async fn list_agents(pool: &PgPool) -> Result<Vec<Agent>> {
    sqlx::query_as::<_, Agent>(
        "SELECT id, name, labels, state, max_concurrency, running_jobs_count, \
                last_heartbeat_at, registered_at \
         FROM agents ORDER BY registered_at",
    )
    .fetch_all(pool)
    .await
    .context("failed to list agents")
}

/// Record a heartbeat: bump `last_heartbeat_at`, update `running_jobs_count`,
/// and transition to `online` if it wasn't already terminal (draining).
pub async fn record_heartbeat(
    pool: &PgPool,
    id: Uuid,
    running_jobs_count: i32,
) -> Result<Option<Agent>> {
    sqlx::query_as::<_, Agent>(
        "UPDATE agents \
         SET last_heartbeat_at = $2, running_jobs_count = $3, \
             state = CASE WHEN state = 'draining' THEN state ELSE 'online' END \
         WHERE id = $1 \
         RETURNING id, name, labels, state, max_concurrency, running_jobs_count, \
                   last_heartbeat_at, registered_at",
    )
    .bind(id)
    .bind(Utc::now())
    .bind(running_jobs_count)
    .fetch_optional(pool)
    .await
    .context("failed to record heartbeat")
}

/// Overlay `labels` onto the agent's existing labels if `merge`, otherwise
/// replace them outright. Returns the effective label set.
pub async fn update_labels(
    pool: &PgPool,
    id: Uuid,
    labels: &serde_json::Value,
    merge: bool,
) -> Result<Option<serde_json::Value>> {
    let sql = if merge {
        "UPDATE agents SET labels = labels || $2 WHERE id = $1 RETURNING labels"
    } else {
        "UPDATE agents SET labels = $2 WHERE id = $1 RETURNING labels"
    };
    let row: Option<(serde_json::Value,)> = sqlx::query_as(sql)
        .bind(id)
        .bind(labels)
        .fetch_optional(pool)
        .await
        .context("failed to update agent labels")?;
    Ok(row.map(|(labels,)| labels))
}

pub async fn set_agent_state(pool: &PgPool, id: Uuid, state: AgentState) -> Result<u64> {
    let result = sqlx::query("UPDATE agents SET state = $2 WHERE id = $1")
        .bind(id)
        .bind(state)
        .execute(pool)
        .await
        .context("failed to update agent state")?;
    Ok(result.rows_affected())
}

/// Agents whose last heartbeat is older than `stale_after` are flipped to
/// `offline`. Returns the number of agents marked offline.
pub async fn mark_stale_agents_offline(
    pool: &PgPool,
    stale_after: chrono::Duration,
) -> Result<u64> {
    let cutoff = Utc::now() - stale_after;
    let result = sqlx::query(
        "UPDATE agents SET state = 'offline' \
         WHERE state != 'offline' \
           AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to mark stale agents offline")?;
    Ok(result.rows_affected())
}
