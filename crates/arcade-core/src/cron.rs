//! Time-based trigger for recurring jobs (C1): heartbeats, stale-agent
//! sweeps, and anything else that needs to fire on a fixed period.
//!
//! There's no external cron crate in reach here, so this is a small
//! `tokio::time::interval` scheduler: entries are parsed from a `@every Ns`
//! spec and each runs as its own spawned task against a shared cancellation
//! token, the same structure the queue worker and RPC client use elsewhere
//! in this crate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A parsed schedule. Only `@every Ns` is supported; anything else is a
/// parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    period: Duration,
}

impl Schedule {
    pub fn every(period: Duration) -> Self {
        Self { period }
    }

    /// Parse a spec of the form `@every 30s`, `@every 5m`, `@every 1h`, or
    /// a bare integer meaning seconds (`@every 60`).
    pub fn parse(spec: &str) -> Result<Self> {
        let rest = spec
            .strip_prefix("@every ")
            .with_context(|| format!("unsupported cron spec {spec:?}, expected \"@every Ns\""))?;
        let rest = rest.trim();

        let (digits, unit) = match rest.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "s"),
        };

        let n: u64 = digits
            .parse()
            .with_context(|| format!("invalid duration in cron spec {spec:?}"))?;

        let period = match unit {
            "s" | "" => Duration::from_secs(n),
            "m" => Duration::from_secs(n * 60),
            "h" => Duration::from_secs(n * 3600),
            other => bail!("unsupported duration unit {other:?} in cron spec {spec:?}"),
        };

        if period.is_zero() {
            bail!("cron spec {spec:?} resolves to a zero period");
        }

        Ok(Self { period })
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

/// One scheduled entry: a name (for logging) and its current period. The
/// period is behind a `Mutex` so a running job can be rescheduled in place,
/// e.g. the heartbeat loop applying a server-supplied interval update.
struct Entry {
    name: String,
    period: Arc<Mutex<Duration>>,
    cancel: CancellationToken,
}

/// Owns a set of recurring jobs, each running in its own task. Stopping the
/// scheduler cancels every entry's tick loop but does not abort jobs
/// already in flight — the caller's job closure is responsible for
/// finishing its own work before observing cancellation.
pub struct CronScheduler {
    root_cancel: CancellationToken,
    entries: Vec<Entry>,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self {
            root_cancel: CancellationToken::new(),
            entries: Vec::new(),
        }
    }

    /// Register a job under `name` with the given schedule. `job` is called
    /// once per tick; it receives a fresh future each time via `make_job`,
    /// since a single `FnMut` closure can't itself be `'static` + cloneable
    /// across spawned tasks.
    pub fn schedule<F, Fut>(&mut self, name: impl Into<String>, schedule: Schedule, make_job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let period = Arc::new(Mutex::new(schedule.period()));
        let cancel = self.root_cancel.child_token();

        let task_name = name.clone();
        let task_period = Arc::clone(&period);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            run_entry(task_name, task_period, task_cancel, make_job).await;
        });

        self.entries.push(Entry { name, period, cancel });
    }

    /// Update the firing period of an already-registered entry; takes
    /// effect on the next tick.
    pub async fn reschedule(&self, name: &str, period: Duration) -> bool {
        for entry in &self.entries {
            if entry.name == name {
                *entry.period.lock().await = period;
                return true;
            }
        }
        false
    }

    /// Stop every entry: no further ticks fire. Already-running job
    /// invocations are left to finish on their own.
    pub fn stop(&self) {
        self.root_cancel.cancel();
    }

    pub fn entry_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_entry<F, Fut>(name: String, period: Arc<Mutex<Duration>>, cancel: CancellationToken, make_job: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    loop {
        let wait = *period.lock().await;
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => {
                tracing::info!(entry = %name, "cron entry stopped, no new fires");
                return;
            }
        }

        if let Err(e) = make_job().await {
            tracing::warn!(entry = %name, error = %e, "cron job failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parses_every_seconds() {
        assert_eq!(Schedule::parse("@every 30s").unwrap().period(), Duration::from_secs(30));
    }

    #[test]
    fn parses_every_minutes() {
        assert_eq!(Schedule::parse("@every 5m").unwrap().period(), Duration::from_secs(300));
    }

    #[test]
    fn parses_every_hours() {
        assert_eq!(Schedule::parse("@every 1h").unwrap().period(), Duration::from_secs(3600));
    }

    #[test]
    fn parses_bare_integer_as_seconds() {
        assert_eq!(Schedule::parse("@every 60").unwrap().period(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_unsupported_spec() {
        assert!(Schedule::parse("* * * * *").is_err());
    }

    #[test]
    fn rejects_zero_period() {
        assert!(Schedule::parse("@every 0s").is_err());
    }

    #[tokio::test]
    async fn entry_fires_repeatedly_until_stopped() {
        let mut scheduler = CronScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let job_count = Arc::clone(&count);
        scheduler.schedule("tick", Schedule::every(Duration::from_millis(5)), move || {
            let job_count = Arc::clone(&job_count);
            async move {
                job_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.stop();
        let seen_after_stop = count.load(Ordering::SeqCst);
        assert!(seen_after_stop >= 2, "expected multiple ticks, saw {seen_after_stop}");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen_after_stop, "no ticks after stop");
    }

    #[tokio::test]
    async fn reschedule_updates_period() {
        let mut scheduler = CronScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let job_count = Arc::clone(&count);
        scheduler.schedule("tick", Schedule::every(Duration::from_secs(60)), move || {
            let job_count = Arc::clone(&job_count);
            async move {
                job_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert!(scheduler.reschedule("tick", Duration::from_millis(5)).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.stop();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn reschedule_unknown_entry_returns_false() {
        let scheduler = CronScheduler::new();
        assert!(!scheduler.reschedule("missing", Duration::from_secs(1)).await);
    }
}
