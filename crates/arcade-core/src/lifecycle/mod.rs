//! Lifecycle supervisor (C12) and shutdown manager (C14).
//!
//! The supervisor launches each long-running piece of the control plane in
//! a background task, in a fixed startup order, and installs a signal
//! handler. The shutdown manager runs the reverse order on trigger,
//! isolating failures so one stage's error doesn't skip the rest.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A named, cancellable background task plus the grace period its shutdown
/// step is given.
pub struct Stage {
    pub name: &'static str,
    pub grace: Duration,
    run: Box<dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>,
}

impl Stage {
    pub fn new<F, Fut>(name: &'static str, grace: Duration, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            grace,
            run: Box::new(move |cancel| Box::pin(run(cancel))),
        }
    }
}

/// Tracks whether a shutdown has been requested, so a readiness probe can
/// flip immediately and a second shutdown trigger is a no-op.
#[derive(Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// Returns `true` if this call triggered the shutdown, `false` if a
    /// shutdown was already in progress.
    pub fn trigger(&self) -> bool {
        let was_set = self.inner.swap(true, Ordering::SeqCst);
        if !was_set {
            self.notify.notify_waiters();
        }
        !was_set
    }

    pub async fn wait(&self) {
        if self.is_shutting_down() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Runs registered stages in order, each in its own task, and coordinates
/// a reverse-order shutdown when triggered.
pub struct Supervisor {
    stages: Vec<Stage>,
    shutdown: ShutdownFlag,
}

impl Supervisor {
    pub fn new(shutdown: ShutdownFlag) -> Self {
        Self {
            stages: Vec::new(),
            shutdown,
        }
    }

    pub fn add_stage(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    /// Launch every stage, wait for a shutdown trigger (signal or external
    /// caller via [`ShutdownFlag::trigger`]), then tear every stage down in
    /// reverse order, giving each its configured grace period. A stage
    /// that doesn't finish within its grace period is abandoned (its task
    /// is dropped) and the next stage is still run.
    pub async fn run(mut self) {
        let mut handles = Vec::with_capacity(self.stages.len());
        let stages = std::mem::take(&mut self.stages);
        let mut names_and_graces = Vec::with_capacity(stages.len());

        let cancel = CancellationToken::new();
        for stage in stages {
            names_and_graces.push((stage.name, stage.grace));
            let stage_cancel = cancel.child_token();
            let fut = (stage.run)(stage_cancel);
            handles.push(tokio::spawn(fut));
        }

        tokio::select! {
            _ = self.shutdown.wait() => {
                tracing::info!("shutdown triggered");
            }
            _ = install_signal_handler() => {
                self.shutdown.trigger();
                tracing::info!("shutdown signal received");
            }
        }

        cancel.cancel();

        for (handle, (name, grace)) in handles.into_iter().zip(names_and_graces).rev() {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => tracing::info!(stage = name, "stage shut down cleanly"),
                Ok(Err(e)) => tracing::error!(stage = name, error = %e, "stage task panicked"),
                Err(_) => tracing::warn!(stage = name, "stage did not shut down within grace period"),
            }
        }
    }
}

#[cfg(unix)]
async fn install_signal_handler() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut quit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    tokio::select! {
        _ = hup.recv() => {}
        _ = int.recv() => {}
        _ = term.recv() => {}
        _ = quit.recv() => {}
    }
}

#[cfg(not(unix))]
async fn install_signal_handler() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn shutdown_flag_trigger_is_single_shot() {
        let flag = ShutdownFlag::new();
        assert!(flag.trigger());
        assert!(!flag.trigger());
        assert!(flag.is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_flag_wait_returns_immediately_if_already_triggered() {
        let flag = ShutdownFlag::new();
        flag.trigger();
        tokio::time::timeout(Duration::from_millis(50), flag.wait())
            .await
            .expect("wait should return immediately");
    }

    #[tokio::test]
    async fn supervisor_runs_stages_and_shuts_down_on_trigger() {
        let shutdown = ShutdownFlag::new();
        let mut supervisor = Supervisor::new(shutdown.clone());

        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));

        for name in ["a", "b"] {
            let started = Arc::clone(&started);
            let stopped = Arc::clone(&stopped);
            supervisor.add_stage(Stage::new(name, Duration::from_secs(1), move |cancel| async move {
                started.fetch_add(1, Ordering::SeqCst);
                cancel.cancelled().await;
                stopped.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let run_handle = tokio::spawn(supervisor.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();
        run_handle.await.unwrap();

        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }
}
