use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use rand::Rng;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::shutdown::Shutdown;

pub mod secret;

static TASK_RESTARTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "task_restarts_total",
        "Restarts of supervised background tasks",
        &["task"]
    )
    .unwrap()
});

/// Applies a `±fraction` multiplicative jitter to a duration so concurrent
/// retries against the same upstream do not synchronize.
pub fn apply_jitter(duration: Duration, fraction: f64) -> Duration {
    let millis = duration.as_millis() as f64;
    let factor = 1.0 + rand::thread_rng().gen_range(-fraction..=fraction);

    Duration::from_millis((millis * factor).max(0.0) as u64)
}

/// Exponential backoff delay for a zero-indexed attempt, capped.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let delay = base.saturating_mul(2u32.saturating_pow(attempt));

    delay.min(cap)
}

/// What a supervised task does with its in-flight run when shutdown begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnShutdown {
    /// Abort the current run immediately.
    Cancel,
    /// Let the current run finish, bounded by the shutdown timeout.
    Finish,
}

/// Runs a background task under supervision until it returns cleanly or the
/// process shuts down.
///
/// Each run executes on its own tokio task, so a panic is contained by the
/// join handle and counted like any other failure. Failed runs restart
/// after `restart_delay`; restarts are exported per task name so a
/// crash-looping task shows up on the dashboard instead of only in logs.
pub fn spawn_supervised<S, F>(
    name: &'static str,
    policy: OnShutdown,
    restart_delay: Duration,
    shutdown: Shutdown,
    spawner: S,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut restarts: u64 = 0;

        loop {
            let mut run = tokio::spawn(spawner());

            tokio::select! {
                outcome = &mut run => {
                    let Some(reason) = failure_reason(outcome) else {
                        info!(task = name, restarts, "supervised task finished");
                        return;
                    };

                    if shutdown.is_shutting_down() {
                        return;
                    }

                    restarts += 1;
                    TASK_RESTARTS.with_label_values(&[name]).inc();
                    error!(task = name, restarts, %reason, "supervised task failed, restarting");

                    sleep(restart_delay).await;
                }
                () = shutdown.await_shutdown_begin() => {
                    match policy {
                        OnShutdown::Cancel => {
                            run.abort();
                        }
                        OnShutdown::Finish => {
                            if timeout(shutdown.timeout(), &mut run).await.is_err() {
                                warn!(task = name, "shutdown grace period over, aborting task");
                                run.abort();
                            }
                        }
                    }
                    return;
                }
            }
        }
    })
}

/// `None` for a clean exit, otherwise what went wrong. Panics are unpacked
/// so the restart log carries the panic message rather than a join error.
fn failure_reason(outcome: Result<anyhow::Result<()>, JoinError>) -> Option<String> {
    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(format!("{err:#}")),
        Err(err) if err.is_panic() => {
            let payload = err.into_panic();
            let message = payload
                .downcast_ref::<&'static str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());

            Some(format!("panicked: {message}"))
        }
        // Aborted; the shutdown path already owns this case.
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);

        for _ in 0..100 {
            let jittered = apply_jitter(base, 0.3);
            assert!(jittered >= Duration::from_millis(700));
            assert!(jittered <= Duration::from_millis(1300));
        }
    }

    #[test]
    fn backoff_delay_doubles_and_caps() {
        let base = Duration::from_millis(250);
        let cap = Duration::from_secs(5);

        assert_eq!(backoff_delay(base, cap, 0), Duration::from_millis(250));
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, cap, 10), cap);
    }

    #[tokio::test]
    async fn failing_task_restarts_until_it_succeeds() -> anyhow::Result<()> {
        let attempts = Arc::new(AtomicUsize::new(0));
        let shutdown = Shutdown::spawn(Duration::from_secs(5), Duration::from_millis(10));

        let handle = {
            let attempts = attempts.clone();
            spawn_supervised(
                "flaky",
                OnShutdown::Cancel,
                Duration::from_millis(10),
                shutdown,
                move || {
                    let attempts = attempts.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            anyhow::bail!("not yet");
                        }
                        Ok(())
                    }
                },
            )
        };

        tokio::time::timeout(Duration::from_secs(2), handle).await??;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        Ok(())
    }

    #[tokio::test]
    async fn panicking_run_is_contained_and_restarted() -> anyhow::Result<()> {
        let attempts = Arc::new(AtomicUsize::new(0));
        let shutdown = Shutdown::spawn(Duration::from_secs(5), Duration::from_millis(10));

        let handle = {
            let attempts = attempts.clone();
            spawn_supervised(
                "panicky",
                OnShutdown::Cancel,
                Duration::from_millis(10),
                shutdown,
                move || {
                    let attempts = attempts.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            panic!("boom");
                        }
                        Ok(())
                    }
                },
            )
        };

        // The supervisor itself must survive the panics and finish cleanly.
        tokio::time::timeout(Duration::from_secs(2), handle).await??;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        Ok(())
    }

    #[tokio::test]
    async fn shutdown_cancels_a_stuck_run() -> anyhow::Result<()> {
        let shutdown = Shutdown::spawn(Duration::from_secs(5), Duration::from_millis(10));

        let handle = spawn_supervised(
            "sleepy",
            OnShutdown::Cancel,
            Duration::from_millis(10),
            shutdown.clone(),
            || async {
                sleep(Duration::from_secs(3600)).await;
                Ok(())
            },
        );

        sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished(), "task should still be supervised");

        shutdown.shutdown();

        tokio::time::timeout(Duration::from_secs(1), handle).await??;

        Ok(())
    }
}
