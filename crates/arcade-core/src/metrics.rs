//! Thin naming layer over the `metrics` crate's global recorder. Keeps
//! metric names and labels in one place instead of scattered through the
//! queue worker, heartbeat loop, and RPC server.

use metrics::{counter, gauge, histogram};

/// Installs a Prometheus exporter as the global recorder and returns the
/// handle the HTTP surface renders under `GET /metrics`. Call once at
/// startup before any of the functions below are used.
pub fn install_recorder() -> anyhow::Result<metrics_exporter_prometheus::PrometheusHandle> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let handle = builder.install_recorder()?;
    Ok(handle)
}

pub fn record_task_claimed(queue_name: &str) {
    counter!("arcade_tasks_claimed_total", "queue" => queue_name.to_string()).increment(1);
}

pub fn record_task_completed(queue_name: &str, task_type: &str) {
    counter!(
        "arcade_tasks_completed_total",
        "queue" => queue_name.to_string(),
        "task_type" => task_type.to_string()
    )
    .increment(1);
}

pub fn record_task_failed(queue_name: &str, task_type: &str) {
    counter!(
        "arcade_tasks_failed_total",
        "queue" => queue_name.to_string(),
        "task_type" => task_type.to_string()
    )
    .increment(1);
}

pub fn record_task_duration_ms(queue_name: &str, duration_ms: u64) {
    histogram!("arcade_task_duration_ms", "queue" => queue_name.to_string()).record(duration_ms as f64);
}

pub fn set_queue_depth(queue_name: &str, depth: i64) {
    gauge!("arcade_queue_depth", "queue" => queue_name.to_string()).set(depth as f64);
}

pub fn set_agent_running_jobs(agent_id: &str, count: i64) {
    gauge!("arcade_agent_running_jobs", "agent_id" => agent_id.to_string()).set(count as f64);
}

pub fn record_rpc_call(method: &str, status: &str) {
    counter!(
        "arcade_rpc_calls_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_heartbeat(agent_id: &str, ok: bool) {
    counter!(
        "arcade_heartbeats_total",
        "agent_id" => agent_id.to_string(),
        "ok" => ok.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_an_installed_recorder_does_not_panic() {
        record_task_claimed("default");
        record_task_completed("default", "job");
        record_task_failed("default", "job");
        record_task_duration_ms("default", 42);
        set_queue_depth("default", 3);
        set_agent_running_jobs("agent-1", 1);
        record_rpc_call("Heartbeat", "ok");
        record_heartbeat("agent-1", true);
    }
}
