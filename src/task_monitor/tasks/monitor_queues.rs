use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{register_int_gauge, IntGauge};
use tokio::time::sleep;

use crate::app::App;
use crate::database::methods::DbMethods as _;
use crate::database::types::JobStatus;

static PENDING_JOBS: Lazy<IntGauge> =
    Lazy::new(|| register_int_gauge!("pending_jobs", "Jobs awaiting submission").unwrap());

static QUEUED_JOBS: Lazy<IntGauge> =
    Lazy::new(|| register_int_gauge!("queued_jobs", "Jobs in flight upstream").unwrap());

pub async fn monitor_queues(app: Arc<App>) -> anyhow::Result<()> {
    loop {
        let pending = app
            .database
            .pool
            .count_videos_by_status(JobStatus::Pending)
            .await?;
        let queued = app
            .database
            .pool
            .count_videos_by_status(JobStatus::Queued)
            .await?;

        PENDING_JOBS.set(pending);
        QUEUED_JOBS.set(queued);

        sleep(Duration::from_secs(30)).await;
    }
}
