//! Queue worker: polls the broker, dispatches claimed entries to a
//! registered handler by task type, and reports ack/nack with ledger
//! writes for each outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use arcade_db::models::{LedgerEventType, QueueEntry, TaskType};

use crate::ledger::Ledger;

use super::broker::Broker;

/// Handles a single claimed queue entry. Implementations translate the
/// entry's payload into whatever work the task type represents (running a
/// pipeline step, dispatching a job, ...).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, entry: &QueueEntry) -> Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn TaskHandler) {}
};

/// Maps a [`TaskType`] to the handler responsible for it.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Box<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_type: TaskType,
        handler: impl TaskHandler + 'static,
    ) -> Option<Box<dyn TaskHandler>> {
        self.handlers.insert(task_type, Box::new(handler))
    }

    pub fn get(&self, task_type: TaskType) -> Option<&dyn TaskHandler> {
        self.handlers.get(&task_type).map(|b| b.as_ref())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue name this worker polls.
    pub queue_name: String,
    /// Maximum number of handlers running concurrently.
    pub concurrency: usize,
    /// How long to sleep between claim attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Delay applied before a nacked entry becomes visible again.
    pub retry_delay: ChronoDuration,
    /// Grace period given to in-flight handlers when shutdown is requested.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            concurrency: 8,
            poll_interval: Duration::from_millis(500),
            retry_delay: ChronoDuration::seconds(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Polls a [`Broker`] for claimable entries and dispatches each to the
/// handler registered for its task type, bounded by a semaphore.
pub struct Worker {
    broker: Broker,
    registry: Arc<HandlerRegistry>,
    ledger: Arc<dyn Ledger>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        broker: Broker,
        registry: Arc<HandlerRegistry>,
        ledger: Arc<dyn Ledger>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            registry,
            ledger,
            config,
        }
    }

    /// Run the poll loop until `cancel` fires, then wait up to
    /// `shutdown_timeout` for in-flight handlers to finish.
    pub async fn run(&self, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight = tokio::task::JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
            };

            let claimed = tokio::select! {
                result = self.broker.claim_one(&self.config.queue_name) => result,
                _ = cancel.cancelled() => break,
            };

            let entry = match claimed {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                        _ = cancel.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to claim queue entry");
                    drop(permit);
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            let broker = self.broker.clone();
            let registry = Arc::clone(&self.registry);
            let ledger = Arc::clone(&self.ledger);
            let retry_delay = self.config.retry_delay;

            in_flight.spawn(async move {
                let _permit = permit;
                dispatch_one(&broker, registry.as_ref(), ledger.as_ref(), entry, retry_delay).await;
            });
        }

        tracing::info!("queue worker shutting down, draining in-flight handlers");
        let _ = tokio::time::timeout(self.config.shutdown_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
    }
}

async fn dispatch_one(
    broker: &Broker,
    registry: &HandlerRegistry,
    ledger: &dyn Ledger,
    entry: QueueEntry,
    retry_delay: ChronoDuration,
) {
    let Some(handler) = registry.get(entry.task_type) else {
        tracing::error!(task_id = %entry.task_id, task_type = %entry.task_type, "no handler registered for task type");
        let _ = broker.nack(entry.id, retry_delay).await;
        return;
    };

    let _ = ledger
        .record(entry.task_id, entry.task_type, &entry.queue_name, LedgerEventType::Started, None, None)
        .await;

    match handler.handle(&entry).await {
        Ok(()) => {
            let _ = broker.ack(entry.id).await;
            let _ = ledger
                .record(entry.task_id, entry.task_type, &entry.queue_name, LedgerEventType::Completed, None, None)
                .await;
        }
        Err(e) => {
            tracing::warn!(task_id = %entry.task_id, error = %e, "task handler failed");
            let _ = broker.nack(entry.id, retry_delay).await;
            let _ = ledger
                .record(
                    entry.task_id,
                    entry.task_type,
                    &entry.queue_name,
                    LedgerEventType::Failed,
                    None,
                    Some(&e.to_string()),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _entry: &QueueEntry) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("handler configured to fail");
            }
            Ok(())
        }
    }

    #[test]
    fn registry_dispatches_by_task_type() {
        let mut registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(
            TaskType::Job,
            CountingHandler {
                calls: Arc::clone(&calls),
                fail: false,
            },
        );

        assert!(registry.get(TaskType::Job).is_some());
        assert!(registry.get(TaskType::Step).is_none());
    }

    #[test]
    fn default_worker_config_is_sane() {
        let config = WorkerConfig::default();
        assert!(config.concurrency > 0);
        assert!(config.poll_interval > Duration::ZERO);
    }
}
