use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::app::App;
use crate::housekeeper::Housekeeper;
use crate::shutdown::Shutdown;
use crate::utils::{spawn_supervised, OnShutdown};

pub mod tasks;

const RESTART_DELAY: Duration = Duration::from_secs(5);

/// One supervised background task and how its exit should be treated.
struct Supervised {
    name: &'static str,
    /// Perpetual tasks never return under normal operation; a one-shot
    /// task (e.g. startup recovery) is expected to.
    perpetual: bool,
    handle: JoinHandle<()>,
}

/// A task manager for all long running tasks
///
/// It's assumed that there is only one instance at a time.
/// Spawning multiple `TaskMonitors` will result in undefined behavior,
/// including data duplication.
pub struct TaskMonitor;

impl TaskMonitor {
    /// Initialize and run the task monitor
    #[instrument(level = "debug", skip_all)]
    pub async fn init(main_app: Arc<App>, shutdown: Shutdown) -> anyhow::Result<()> {
        let mut supervised = Vec::new();

        // Housekeeping (daily resets, stale job expiry)
        let housekeeper = Housekeeper::new(
            main_app.database.clone(),
            main_app.config.housekeeper.clone(),
        )?;
        supervised.push(Supervised {
            name: "housekeeping",
            perpetual: true,
            handle: spawn_supervised(
                "housekeeping",
                OnShutdown::Cancel,
                RESTART_DELAY,
                shutdown.clone(),
                move || housekeeper.clone().run(),
            ),
        });

        // Startup recovery of jobs orphaned by the previous process. Runs
        // once; allowed to finish its scan during a shutdown.
        let app = main_app.clone();
        supervised.push(Supervised {
            name: "recover_jobs",
            perpetual: false,
            handle: spawn_supervised(
                "recover_jobs",
                OnShutdown::Finish,
                RESTART_DELAY,
                shutdown.clone(),
                move || tasks::recover_jobs::recover_jobs(app.clone()),
            ),
        });

        // Report queue depths
        let app = main_app.clone();
        supervised.push(Supervised {
            name: "monitor_queues",
            perpetual: true,
            handle: spawn_supervised(
                "monitor_queues",
                OnShutdown::Cancel,
                RESTART_DELAY,
                shutdown.clone(),
                move || tasks::monitor_queues::monitor_queues(app.clone()),
            ),
        });

        tokio::spawn(Self::watch_tasks(supervised, shutdown));

        Ok(())
    }

    /// Waits on all supervised handles at once. One-shot tasks completing
    /// is normal; a perpetual task returning outside of shutdown means the
    /// service lost a core loop, so the process winds down rather than
    /// limping on without it.
    async fn watch_tasks(supervised: Vec<Supervised>, shutdown: Shutdown) {
        let mut meta: Vec<(&'static str, bool)> = supervised
            .iter()
            .map(|task| (task.name, task.perpetual))
            .collect();
        let mut handles: Vec<JoinHandle<()>> =
            supervised.into_iter().map(|task| task.handle).collect();

        while !handles.is_empty() {
            let (result, index, rest) = select_all(handles).await;
            let (name, perpetual) = meta.remove(index);
            handles = rest;

            if shutdown.is_shutting_down() {
                return;
            }

            match result {
                Err(err) => {
                    error!(task = name, ?err, "task supervisor died, shutting down");
                    shutdown.shutdown();
                    return;
                }
                Ok(()) if perpetual => {
                    warn!(task = name, "core task stopped, shutting down");
                    shutdown.shutdown();
                    return;
                }
                Ok(()) => {
                    info!(task = name, "task completed");
                }
            }
        }
    }
}
