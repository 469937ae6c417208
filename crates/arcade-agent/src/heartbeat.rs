//! Agent Heartbeat Loop (C10): waits for the RPC client to report a
//! connected state, sends one heartbeat immediately, then schedules the
//! recurring tick via the cron scheduler. Failures are logged and skipped
//! rather than aborting the loop -- a single dropped heartbeat shouldn't
//! take the agent process down.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use uuid::Uuid;

use arcade_core::cron::{CronScheduler, Schedule};
use arcade_rpc::client::{ConnState, RpcClient};
use arcade_rpc::proto::{HeartbeatRequest, HeartbeatResponse};

const CONNECT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared counter of currently-running step executions, mirrored into the
/// `agent_running_jobs` metrics gauge on every heartbeat tick.
#[derive(Clone)]
pub struct RunningJobs(Arc<AtomicI64>);

impl RunningJobs {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(0)))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for RunningJobs {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `client`'s connection state every second, up to 30s, for
/// [`ConnState::Connected`]. Returns an error once the deadline passes.
async fn wait_for_connected(client: &RpcClient) -> Result<()> {
    let deadline = tokio::time::Instant::now() + CONNECT_WAIT_TIMEOUT;
    loop {
        if client.state().await == ConnState::Connected {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for control plane connection after {CONNECT_WAIT_TIMEOUT:?}");
        }
        tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
    }
}

async fn send_heartbeat(
    client: &RpcClient,
    agent_id: Uuid,
    agent_name: &str,
    running_jobs: &RunningJobs,
) -> Result<HeartbeatResponse> {
    let count = running_jobs.get();
    arcade_core::metrics::set_agent_running_jobs(&agent_id.to_string(), count);

    let req = HeartbeatRequest {
        agent_id,
        agent_name: agent_name.to_string(),
        status: "online".to_string(),
        running_jobs_count: count as i32,
        timestamp: Utc::now(),
    };

    client
        .call::<_, HeartbeatResponse>("Heartbeat", &req)
        .await
        .context("heartbeat call failed")
}

/// Runs the startup sequence (wait for connection, send one heartbeat),
/// then registers the recurring tick with `scheduler` under the name
/// `"heartbeat"`. A response carrying a new interval reschedules the
/// entry on the following tick, matching `spec.md`'s "applied at the next
/// cron tick" semantics (the already-in-flight sleep isn't interrupted).
pub async fn start(
    client: RpcClient,
    scheduler: &mut CronScheduler,
    agent_id: Uuid,
    agent_name: String,
    running_jobs: RunningJobs,
    initial_interval_secs: u64,
) -> Result<()> {
    wait_for_connected(&client).await?;

    let response = send_heartbeat(&client, agent_id, &agent_name, &running_jobs).await?;
    tracing::info!(agent_id = %agent_id, "initial heartbeat sent");
    apply_response(&response, agent_name.as_str());

    let schedule = Schedule::every(Duration::from_secs(
        response.heartbeat_interval_secs.unwrap_or(initial_interval_secs).max(1),
    ));

    scheduler.schedule("heartbeat", schedule, move || {
        let client = client.clone();
        let agent_name = agent_name.clone();
        let running_jobs = running_jobs.clone();
        async move {
            match send_heartbeat(&client, agent_id, &agent_name, &running_jobs).await {
                Ok(response) => apply_response(&response, &agent_name),
                Err(e) => tracing::warn!(error = %e, "heartbeat failed, will retry next tick"),
            }
            Ok(())
        }
    });

    Ok(())
}

fn apply_response(response: &HeartbeatResponse, agent_name: &str) {
    if let Some(labels) = &response.labels {
        tracing::debug!(agent_name, label_count = labels.len(), "heartbeat response carried label update");
    }
    if let Some(interval) = response.heartbeat_interval_secs {
        tracing::debug!(agent_name, interval, "heartbeat response carried interval update");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_jobs_tracks_increments_and_decrements() {
        let jobs = RunningJobs::new();
        assert_eq!(jobs.get(), 0);
        jobs.increment();
        jobs.increment();
        assert_eq!(jobs.get(), 2);
        jobs.decrement();
        assert_eq!(jobs.get(), 1);
    }

    #[tokio::test]
    async fn wait_for_connected_returns_immediately_when_already_connected() {
        let client = RpcClient::new("example.com", 5);
        tokio::time::timeout(Duration::from_millis(50), wait_for_connected(&client))
            .await
            .expect("should not time out")
            .expect("should succeed");
    }
}
