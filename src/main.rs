use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use render_sequencer::app::App;
use render_sequencer::config::load_config;
use render_sequencer::shutdown::Shutdown;
use render_sequencer::task_monitor::TaskMonitor;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration. Environment variables with the
    /// `SEQ__` prefix override file values.
    #[arg(short, long, env = "SEQ_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let config = load_config(args.config.as_deref())?;

            info!(
                service = %config.service.service_name,
                version = env!("CARGO_PKG_VERSION"),
                "starting"
            );

            let shutdown = Shutdown::spawn(
                config.app.shutdown_timeout,
                config.app.shutdown_delay,
            );

            let app = App::new(config).await?;

            TaskMonitor::init(app, shutdown.clone()).await?;

            shutdown.await_shutdown_complete().await;

            info!("Program terminating normally");

            anyhow::Ok(())
        })
}
