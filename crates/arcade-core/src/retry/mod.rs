//! Retry policy (C3): backoff strategies with jitter, plus a cancellable
//! `do_with_retry` driver used by the task queue worker and pipeline
//! executor when a step or RPC call fails.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay every attempt.
    Fixed { delay: Duration },
    /// `base + increment * attempt`.
    Linear { base: Duration, increment: Duration },
    /// `base * multiplier^attempt`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Backoff {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Linear { base, increment } => *base + *increment * attempt,
            Backoff::Exponential {
                base,
                multiplier,
                max,
            } => {
                let scaled = base.as_secs_f64() * multiplier.powi(attempt as i32);
                Duration::from_secs_f64(scaled).min(*max)
            }
        }
    }
}

/// Spreads a delay by up to the given fraction in either direction, so a
/// herd of workers retrying the same failure doesn't wake in lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    pub fraction: f64,
}

impl Jitter {
    pub const NONE: Jitter = Jitter { fraction: 0.0 };

    pub fn apply(&self, delay: Duration) -> Duration {
        if self.fraction <= 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.fraction;
        let offset = rand::random::<f64>() * 2.0 * spread - spread;
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

/// Retry policy: how many attempts, with what backoff and jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub jitter: Jitter,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(200),
                multiplier: 2.0,
                max: Duration::from_secs(30),
            },
            jitter: Jitter { fraction: 0.2 },
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("operation failed after {attempts} attempt(s): {source}")]
    Exhausted { attempts: u32, source: E },
    #[error("retry cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

/// Run `op` until it succeeds, attempts are exhausted, or `cancel` fires.
///
/// `op` is called once per attempt; its error is passed to `should_retry`
/// to decide whether another attempt is worth making (e.g. to stop retrying
/// on a permanent validation error).
pub async fn do_with_retry<T, E, F, Fut, R>(
    options: &RetryOptions,
    cancel: &CancellationToken,
    mut should_retry: R,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = op(attempt).await;
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt >= options.max_attempts || !should_retry(&err) {
            warn!(attempt, error = %err, "retry exhausted");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: err,
            });
        }

        let delay = options.jitter.apply(options.backoff.delay_for(attempt - 1));
        debug!(attempt, delay_ms = delay.as_millis(), error = %err, "retrying after error");

        tokio::select! {
            _ = sleep(delay) => {}
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fixed_backoff_is_constant() {
        let b = Backoff::Fixed {
            delay: Duration::from_millis(50),
        };
        assert_eq!(b.delay_for(0), Duration::from_millis(50));
        assert_eq!(b.delay_for(10), Duration::from_millis(50));
    }

    #[test]
    fn linear_backoff_grows_by_increment() {
        let b = Backoff::Linear {
            base: Duration::from_millis(100),
            increment: Duration::from_millis(50),
        };
        assert_eq!(b.delay_for(0), Duration::from_millis(100));
        assert_eq!(b.delay_for(2), Duration::from_millis(200));
    }

    #[test]
    fn exponential_backoff_caps_at_max() {
        let b = Backoff::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(500),
        };
        assert_eq!(b.delay_for(0), Duration::from_millis(100));
        assert_eq!(b.delay_for(1), Duration::from_millis(200));
        assert_eq!(b.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn jitter_none_is_identity() {
        let delay = Duration::from_millis(100);
        assert_eq!(Jitter::NONE.apply(delay), delay);
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let delay = Duration::from_millis(1000);
        let jitter = Jitter { fraction: 0.25 };
        for _ in 0..50 {
            let jittered = jitter.apply(delay);
            assert!(jittered.as_millis() >= 750);
            assert!(jittered.as_millis() <= 1250);
        }
    }

    #[tokio::test]
    async fn do_with_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let options = RetryOptions {
            max_attempts: 5,
            backoff: Backoff::Fixed {
                delay: Duration::from_millis(1),
            },
            jitter: Jitter::NONE,
        };
        let cancel = CancellationToken::new();

        let result: Result<&str, RetryError<String>> = do_with_retry(
            &options,
            &cancel,
            |_err: &String| true,
            |attempt| {
                let calls = &calls;
                async move {
                    if attempt < 3 {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err("transient".to_string())
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn do_with_retry_exhausts_after_max_attempts() {
        let options = RetryOptions {
            max_attempts: 3,
            backoff: Backoff::Fixed {
                delay: Duration::from_millis(1),
            },
            jitter: Jitter::NONE,
        };
        let cancel = CancellationToken::new();

        let result: Result<(), RetryError<String>> = do_with_retry(
            &options,
            &cancel,
            |_err: &String| true,
            |_attempt| async { Err("always fails".to_string()) },
        )
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn do_with_retry_stops_when_should_retry_returns_false() {
        let options = RetryOptions::default();
        let cancel = CancellationToken::new();

        let result: Result<(), RetryError<String>> = do_with_retry(
            &options,
            &cancel,
            |_err: &String| false,
            |_attempt| async { Err("permanent".to_string()) },
        )
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn do_with_retry_honors_cancellation() {
        let options = RetryOptions {
            max_attempts: 10,
            backoff: Backoff::Fixed {
                delay: Duration::from_secs(60),
            },
            jitter: Jitter::NONE,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), RetryError<String>> = do_with_retry(
            &options,
            &cancel,
            |_err: &String| true,
            |_attempt| async { Err("always fails".to_string()) },
        )
        .await;

        match result {
            Err(RetryError::Cancelled { attempts }) => assert_eq!(attempts, 1),
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }
}
