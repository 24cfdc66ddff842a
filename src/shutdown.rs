use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

/// A cloneable handle to the process-wide shutdown signal.
///
/// Components hold a clone and either poll `is_shutting_down` or await
/// `await_shutdown_begin`. The CLI entrypoint uses `timeout`/`delay` to give
/// in-flight tasks a chance to reach an await point before the process exits.
#[derive(Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
    timeout: Duration,
    delay: Duration,
}

impl Shutdown {
    /// Creates the shutdown handle and registers the OS signal listener.
    pub fn spawn(timeout: Duration, delay: Duration) -> Self {
        let (sender, receiver) = watch::channel(false);

        let shutdown = Self {
            sender: Arc::new(sender),
            receiver,
            timeout,
            delay,
        };

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(err) = await_signal().await {
                    tracing::error!("Error handling shutdown signal: {err}");
                }
                shutdown.shutdown();
            }
        });

        shutdown
    }

    /// Send the signal to shutdown the program.
    pub fn shutdown(&self) {
        // Does not fail because we hold a receiver.
        self.sender.send(true).ok();
    }

    /// Are we currently shutting down?
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for the program to start shutting down.
    ///
    /// Resolves immediately if the program is already shutting down.
    /// The resulting future is safe to cancel by dropping.
    pub async fn await_shutdown_begin(&self) {
        let mut watch = self.receiver.clone();
        if *watch.borrow_and_update() {
            return;
        }
        // Does not fail because the sender is kept alive by self.
        watch.changed().await.ok();
    }

    /// Waits for shutdown, then sleeps the configured grace delay so
    /// cancelled tasks can reach an await point.
    pub async fn await_shutdown_complete(&self) {
        self.await_shutdown_begin().await;
        tokio::time::sleep(self.delay).await;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(unix)]
async fn await_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt())?;
    let sigterm = signal(SignalKind::terminate())?;
    tokio::pin!(sigint);
    tokio::pin!(sigterm);
    tokio::select! {
        _ = sigint.recv() => { info!("SIGINT received, shutting down"); }
        _ = sigterm.recv() => { info!("SIGTERM received, shutting down"); }
    };
    Ok(())
}

#[cfg(not(unix))]
async fn await_signal() -> anyhow::Result<()> {
    use tokio::signal::ctrl_c;

    ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::time::{sleep, Duration};

    use super::*;

    #[tokio::test]
    async fn shutdown_signal() {
        let start = tokio::time::Instant::now();
        let shutdown = Shutdown::spawn(Duration::from_secs(30), Duration::from_secs(1));

        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                sleep(Duration::from_millis(100)).await;
                shutdown.shutdown();
            }
        });

        shutdown.await_shutdown_begin().await;

        let elapsed = start.elapsed();

        assert!(elapsed > Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
        assert!(shutdown.is_shutting_down());
    }
}
