//! Step fetch/execute/report loop: polls the control plane for claimable
//! step runs, executes each against the builtin step registry, and
//! reports the outcome back. Concurrency is tracked through
//! [`crate::heartbeat::RunningJobs`] so the heartbeat loop reports an
//! accurate `running_jobs_count`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use arcade_core::steps::{StepContext, StepRegistry};
use arcade_rpc::client::RpcClient;
use arcade_rpc::proto::{
    FetchStepRunRequest, FetchStepRunResponse, ReportStepRunStatusRequest,
    ReportStepRunStatusResponse, StepRunDescriptor,
};

use crate::heartbeat::RunningJobs;

pub struct Dispatcher {
    client: RpcClient,
    registry: Arc<StepRegistry>,
    agent_id: Uuid,
    running_jobs: RunningJobs,
    workspace_root: PathBuf,
    poll_interval: Duration,
    max_step_runs: i64,
}

impl Dispatcher {
    pub fn new(
        client: RpcClient,
        registry: Arc<StepRegistry>,
        agent_id: Uuid,
        running_jobs: RunningJobs,
        workspace_root: PathBuf,
        poll_interval: Duration,
        max_step_runs: i64,
    ) -> Self {
        Self {
            client,
            registry,
            agent_id,
            running_jobs,
            workspace_root,
            poll_interval,
            max_step_runs,
        }
    }

    /// Poll until `cancel` fires. Each claimed step run is executed on its
    /// own spawned task so a slow step never blocks polling for the next
    /// batch.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return,
            }

            let req = FetchStepRunRequest {
                agent_id: self.agent_id,
                max_step_runs: self.max_step_runs,
            };

            let response = match self.client.call::<_, FetchStepRunResponse>("FetchStepRun", &req).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(error = %e, "fetch step run failed");
                    continue;
                }
            };

            for descriptor in response.step_runs {
                let this = Arc::clone(&self);
                tokio::spawn(async move { this.execute(descriptor).await });
            }
        }
    }

    async fn execute(&self, descriptor: StepRunDescriptor) {
        self.running_jobs.increment();
        let outcome = self.run_one(&descriptor).await;
        self.running_jobs.decrement();

        let (status, stdout, stderr, error) = match outcome {
            Ok(outcome) if outcome.success => ("succeeded".to_string(), Some(outcome.stdout), Some(outcome.stderr), None),
            Ok(outcome) => ("failed".to_string(), Some(outcome.stdout), Some(outcome.stderr), outcome.error),
            Err(e) => ("failed".to_string(), None, None, Some(e.to_string())),
        };

        let req = ReportStepRunStatusRequest {
            agent_id: self.agent_id,
            step_run_id: descriptor.step_run_id,
            status,
            stdout,
            stderr,
            error,
        };

        match self.client.call::<_, ReportStepRunStatusResponse>("ReportStepRunStatus", &req).await {
            Ok(response) if !response.applied => {
                tracing::debug!(step_run_id = %descriptor.step_run_id, "status report was a no-op (already terminal)");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(step_run_id = %descriptor.step_run_id, error = %e, "failed to report step run status"),
        }
    }

    async fn run_one(&self, descriptor: &StepRunDescriptor) -> anyhow::Result<arcade_core::steps::StepOutcome> {
        let runner = self
            .registry
            .get(&descriptor.action)
            .ok_or_else(|| anyhow::anyhow!("no step runner registered for action {:?}", descriptor.action))?;

        let ctx = StepContext {
            workspace: self.workspace_root.join(descriptor.job_id.to_string()),
            env: std::collections::HashMap::new(),
            pipeline_namespace: descriptor.job_id.to_string(),
            build_id: descriptor.step_run_id.to_string(),
            workspace_root: self.workspace_root.clone(),
        };

        runner.run(&ctx, &descriptor.params).await
    }
}
