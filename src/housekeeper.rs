use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{info, instrument, warn};

use crate::config::HousekeeperConfig;
use crate::database::methods::DbMethods as _;
use crate::database::Database;

/// Periodic maintenance driven by a single one-minute tick: the daily
/// counter reset at local midnight, and expiry of jobs that stopped making
/// progress (e.g. orphaned by a process restart).
pub struct Housekeeper {
    database: Arc<Database>,
    config: HousekeeperConfig,
    reset_offset: FixedOffset,
    last_reset_date: Mutex<Option<NaiveDate>>,
}

impl Housekeeper {
    pub fn new(database: Arc<Database>, config: HousekeeperConfig) -> anyhow::Result<Arc<Self>> {
        let reset_offset = FixedOffset::east_opt(config.daily_reset_utc_offset_hours * 3600)
            .ok_or_else(|| anyhow::anyhow!("invalid daily reset UTC offset"))?;

        Ok(Arc::new(Self {
            database,
            config,
            reset_offset,
            last_reset_date: Mutex::new(None),
        }))
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut timer = tokio::time::interval(self.config.tick_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            timer.tick().await;
            self.tick(Utc::now()).await?;
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let local_date = local_date(now, self.reset_offset);

        let reset_due = {
            let mut last = self.last_reset_date.lock().expect("reset date poisoned");
            if *last == Some(local_date) {
                false
            } else {
                *last = Some(local_date);
                true
            }
        };

        if reset_due {
            let reset = self
                .database
                .with_retry(|| async {
                    self.database.pool.reset_expired_daily_counts(local_date).await
                })
                .await?;

            if reset > 0 {
                info!(users = reset, date = %local_date, "reset daily video counters");
            }
        }

        self.expire_stale_jobs(now).await?;

        Ok(())
    }

    /// Fails non-terminal jobs whose last write is older than the staleness
    /// threshold. These are jobs the in-memory queues no longer know about.
    async fn expire_stale_jobs(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let threshold = chrono::Duration::from_std(self.config.stale_job_threshold)?;
        let cutoff = now - threshold;

        let stale = self
            .database
            .with_retry(|| async { self.database.pool.get_stale_processing_videos(cutoff).await })
            .await?;

        for video in stale {
            warn!(
                job_id = video.id,
                updated_at = %video.updated_at,
                "expiring stale job"
            );

            self.database
                .with_retry(|| async {
                    self.database
                        .pool
                        .mark_video_failed(
                            video.id,
                            "Job expired: no progress recorded within the staleness window",
                        )
                        .await
                })
                .await?;
        }

        Ok(())
    }
}

/// Calendar date at the configured offset; the reset boundary is local
/// midnight, not UTC midnight.
fn local_date(now: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    now.with_timezone(&offset).date_naive()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn local_date_rolls_at_offset_midnight() {
        let offset = FixedOffset::east_opt(5 * 3600).unwrap();

        // 18:59 UTC = 23:59 UTC+5, still the same local day.
        let before = Utc.with_ymd_and_hms(2024, 5, 10, 18, 59, 0).unwrap();
        assert_eq!(
            local_date(before, offset),
            NaiveDate::from_ymd_opt(2024, 5, 10).unwrap()
        );

        // 19:00 UTC = 00:00 UTC+5 the next day.
        let after = Utc.with_ymd_and_hms(2024, 5, 10, 19, 0, 0).unwrap();
        assert_eq!(
            local_date(after, offset),
            NaiveDate::from_ymd_opt(2024, 5, 11).unwrap()
        );
    }

    #[test]
    fn utc_offset_zero_matches_utc_date() {
        let offset = FixedOffset::east_opt(0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 23, 59, 59).unwrap();

        assert_eq!(
            local_date(now, offset),
            NaiveDate::from_ymd_opt(2024, 5, 10).unwrap()
        );
    }
}
