use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use once_cell::sync::Lazy;
use prometheus::{register_int_gauge, IntGauge};
use tokio::time::{sleep, Instant};
use tracing::{error, info, instrument, warn};

use crate::config::AppConfig;
use crate::database::methods::DbMethods as _;
use crate::database::types::{AspectRatio, VideoUpdate};
use crate::database::Database;
use crate::media::MediaUploader;
use crate::token_pool::TokenPool;
use crate::upstream::data::{scene_id_for_job, VideoStatus};
use crate::upstream::VideoApi;
use crate::utils::apply_jitter;

/// Cap on the per-job backoff between polls after consecutive failures.
const MAX_FAILURE_BACKOFF: Duration = Duration::from_secs(120);

static POLLING_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("polling_queue_depth", "Jobs waiting for a polling worker").unwrap()
});

static ACTIVE_POLL_WORKERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("active_poll_workers", "Polling workers currently running").unwrap()
});

/// One in-flight job tracked to a terminal state.
#[derive(Clone, Debug)]
pub struct PollJob {
    pub job_id: i64,
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    pub operation_name: String,
    pub scene_id: String,
    /// Credential used for status checks and a potential re-submission.
    pub api_key: String,
    /// Pool token backing `api_key`, if it came from the pool.
    pub token_id: Option<i64>,
    /// Uploaded reference image backing an image-to-video job, if any.
    pub reference_media_id: Option<String>,
}

type SharedUpload = Shared<BoxFuture<'static, Result<String, String>>>;

/// Drives accepted jobs to a terminal state with a bounded worker pool.
///
/// No job owns an OS thread: up to `max_concurrent_workers` tokio tasks each
/// drain the queue, polling one job at a time. All terminal decisions are
/// written through the store; the queue, worker counter and upload-dedup map
/// are process-local.
pub struct PollingCoordinator {
    database: Arc<Database>,
    token_pool: Arc<TokenPool>,
    video_api: Arc<VideoApi>,
    media: Arc<MediaUploader>,
    config: AppConfig,
    queue: Mutex<VecDeque<PollJob>>,
    active_workers: AtomicUsize,
    uploads_in_flight: Mutex<HashMap<String, SharedUpload>>,
    last_heartbeat: Mutex<HashMap<i64, Instant>>,
}

impl PollingCoordinator {
    pub fn new(
        database: Arc<Database>,
        token_pool: Arc<TokenPool>,
        video_api: Arc<VideoApi>,
        media: Arc<MediaUploader>,
        config: AppConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            database,
            token_pool,
            video_api,
            media,
            config,
            queue: Mutex::new(VecDeque::new()),
            active_workers: AtomicUsize::new(0),
            uploads_in_flight: Mutex::new(HashMap::new()),
            last_heartbeat: Mutex::new(HashMap::new()),
        })
    }

    /// Accepts a job for polling and spawns workers up to the cap.
    pub fn enqueue_status_check(self: &Arc<Self>, job: PollJob) {
        {
            let mut queue = self.queue.lock().expect("queue poisoned");
            queue.push_back(job);
            POLLING_QUEUE_DEPTH.set(queue.len() as i64);
        }

        self.spawn_workers();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("queue poisoned").len()
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    fn pop_job(&self) -> Option<PollJob> {
        let mut queue = self.queue.lock().expect("queue poisoned");
        let job = queue.pop_front();
        POLLING_QUEUE_DEPTH.set(queue.len() as i64);
        job
    }

    fn spawn_workers(self: &Arc<Self>) {
        loop {
            if self.queue.lock().expect("queue poisoned").is_empty() {
                return;
            }

            let active = self.active_workers.load(Ordering::SeqCst);
            if active >= self.config.max_concurrent_workers {
                return;
            }

            if self
                .active_workers
                .compare_exchange(active, active + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            ACTIVE_POLL_WORKERS.set(self.active_workers.load(Ordering::SeqCst) as i64);

            let this = self.clone();
            tokio::spawn(async move {
                while let Some(job) = this.pop_job() {
                    this.poll_job(job).await;
                }

                this.active_workers.fetch_sub(1, Ordering::SeqCst);
                ACTIVE_POLL_WORKERS.set(this.active_workers.load(Ordering::SeqCst) as i64);

                // A job may have been enqueued after this worker drained the
                // queue but before the counter was decremented.
                this.spawn_workers();
            });
        }
    }

    /// Polls one job to a terminal state. Exceptions never escape: any
    /// uncaught error marks the job failed.
    async fn poll_job(&self, mut job: PollJob) {
        let job_id = job.job_id;

        if let Err(err) = self.poll_job_inner(&mut job).await {
            error!(job_id, ?err, "polling worker error, failing job");

            let result = self
                .database
                .with_retry(|| async {
                    self.database
                        .pool
                        .mark_video_failed(job_id, &format!("Internal error: {err}"))
                        .await
                })
                .await;

            if let Err(err) = result {
                error!(job_id, ?err, "failed to persist job failure");
            }
        }

        self.last_heartbeat
            .lock()
            .expect("heartbeat map poisoned")
            .remove(&job_id);
    }

    async fn poll_job_inner(&self, job: &mut PollJob) -> anyhow::Result<()> {
        sleep(self.config.initial_poll_delay).await;

        let mut consecutive_failures: u32 = 0;
        let mut token_switched = false;

        for attempt in 0..self.config.max_poll_attempts {
            if attempt > 0 {
                sleep(self.poll_delay(consecutive_failures)).await;
            }

            self.maybe_heartbeat(job.job_id).await;

            if attempt == self.config.token_retry_attempt && !token_switched {
                token_switched = true;
                if self.switch_token(job).await? {
                    consecutive_failures = 0;
                    continue;
                }
            }

            let status = self
                .video_api
                .check_status(
                    &job.api_key,
                    &job.operation_name,
                    &job.scene_id,
                    self.config.status_check_timeout,
                )
                .await;

            match status {
                Ok(status) => match status.outcome() {
                    VideoStatus::Complete { video_url } => {
                        self.finish_job(job, &video_url).await?;
                        return Ok(());
                    }
                    VideoStatus::Error { message } => {
                        if let Some(token_id) = job.token_id {
                            self.token_pool.record_error(token_id);
                        }

                        info!(job_id = job.job_id, %message, "upstream reported failure");
                        self.database
                            .with_retry(|| async {
                                self.database
                                    .pool
                                    .mark_video_failed(job.job_id, &message)
                                    .await
                            })
                            .await?;
                        return Ok(());
                    }
                    VideoStatus::Pending => {
                        consecutive_failures = 0;
                    }
                },
                Err(err) if err.is_transient() => {
                    consecutive_failures += 1;
                    warn!(
                        job_id = job.job_id,
                        consecutive_failures,
                        ?err,
                        "transient status check failure"
                    );
                }
                Err(err) => {
                    // Unexpected but well-formed response; keep polling.
                    warn!(job_id = job.job_id, ?err, "status check returned an error");
                    consecutive_failures = 0;
                }
            }
        }

        let waited = self.config.poll_interval.as_secs() * u64::from(self.config.max_poll_attempts);
        let message = format!(
            "Video generation timed out after {waited} seconds ({} attempts)",
            self.config.max_poll_attempts
        );

        self.database
            .with_retry(|| async { self.database.pool.mark_video_failed(job.job_id, &message).await })
            .await?;

        Ok(())
    }

    /// Delay before the next poll: the base interval, or an exponential
    /// backoff with jitter while consecutive failures accumulate.
    fn poll_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.config.poll_interval;
        }

        let backoff = self
            .config
            .poll_interval
            .saturating_mul(2u32.saturating_pow(consecutive_failures - 1));

        apply_jitter(backoff.min(MAX_FAILURE_BACKOFF), 0.1).min(MAX_FAILURE_BACKOFF)
    }

    /// Rate-limited `updated_at` touch so the housekeeper can tell a polled
    /// job from an orphaned one.
    async fn maybe_heartbeat(&self, job_id: i64) {
        let due = {
            let mut map = self.last_heartbeat.lock().expect("heartbeat map poisoned");
            match map.get(&job_id) {
                Some(last) if last.elapsed() < self.config.heartbeat_interval => false,
                _ => {
                    map.insert(job_id, Instant::now());
                    true
                }
            }
        };

        if !due {
            return;
        }

        let result = self
            .database
            .with_retry(|| async { self.database.pool.touch_video(job_id).await })
            .await;

        if let Err(err) = result {
            warn!(job_id, ?err, "heartbeat write failed");
        }
    }

    /// One mid-flight token switch: records an error against the current
    /// token, dispenses a fresh one in rotation mode and re-submits the job
    /// under a new scene id. Returns false when no token was available, in
    /// which case polling continues against the old operation.
    #[instrument(skip(self, job), fields(job_id = job.job_id), level = "debug")]
    async fn switch_token(&self, job: &mut PollJob) -> anyhow::Result<bool> {
        if let Some(token_id) = job.token_id {
            self.token_pool.record_error(token_id);
        }

        let Some(token) = self.token_pool.next_rotation_token().await? else {
            warn!(job_id = job.job_id, "no rotation token available, keeping current token");
            return Ok(false);
        };

        let new_scene_id = scene_id_for_job(job.job_id);

        let submit = match &job.reference_media_id {
            Some(media_id) => {
                self.video_api
                    .submit_image_to_video(
                        &token.token,
                        media_id,
                        &job.prompt,
                        job.aspect_ratio,
                        &new_scene_id,
                        self.config.submit_timeout,
                    )
                    .await
            }
            None => {
                self.video_api
                    .submit_text_to_video(
                        &token.token,
                        &job.prompt,
                        job.aspect_ratio,
                        &new_scene_id,
                        self.config.submit_timeout,
                    )
                    .await
            }
        };

        let operation_name = match submit {
            Ok(name) => name,
            Err(err) => {
                warn!(job_id = job.job_id, ?err, "token switch re-submission failed");
                self.token_pool.record_error(token.id);
                return Ok(false);
            }
        };

        self.database
            .with_retry(|| async {
                self.database
                    .pool
                    .update_video_fields(
                        job.job_id,
                        None,
                        &VideoUpdate {
                            operation_name: Some(operation_name.clone()),
                            scene_id: Some(new_scene_id.clone()),
                            token_used: Some(token.id),
                            ..VideoUpdate::default()
                        },
                    )
                    .await
            })
            .await?;

        info!(
            job_id = job.job_id,
            old_token = ?job.token_id,
            new_token = token.id,
            "switched job to a fresh token mid-flight"
        );

        job.api_key = token.token.clone();
        job.token_id = Some(token.id);
        job.operation_name = operation_name;
        job.scene_id = new_scene_id;

        Ok(true)
    }

    async fn finish_job(&self, job: &PollJob, upstream_url: &str) -> anyhow::Result<()> {
        match self.upload_once(&job.scene_id, upstream_url).await {
            Ok(hosted_url) => {
                self.database
                    .with_retry(|| async {
                        self.database
                            .pool
                            .mark_video_completed(job.job_id, &hosted_url)
                            .await
                    })
                    .await?;

                info!(job_id = job.job_id, "job completed");
            }
            Err(message) => {
                self.database
                    .with_retry(|| async {
                        self.database
                            .pool
                            .mark_video_failed(
                                job.job_id,
                                &format!("Media upload failed: {message}"),
                            )
                            .await
                    })
                    .await?;
            }
        }

        Ok(())
    }

    /// At-most-once upload per scene: the first caller starts the upload and
    /// publishes a shared future; concurrent callers await the same result.
    /// A failed upload clears the slot so a later attempt can retry.
    pub async fn upload_once(&self, scene_id: &str, upstream_url: &str) -> Result<String, String> {
        let (upload, initiated) = {
            let mut map = self.uploads_in_flight.lock().expect("upload map poisoned");

            match map.get(scene_id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let media = self.media.clone();
                    let url = upstream_url.to_string();
                    let upload: SharedUpload = async move {
                        media
                            .upload_video(&url)
                            .await
                            .map_err(|err| err.to_string())
                    }
                    .boxed()
                    .shared();

                    map.insert(scene_id.to_string(), upload.clone());
                    (upload, true)
                }
            }
        };

        let result = upload.await;

        if initiated || result.is_err() {
            // The slot only tracks in-flight work; failures are cleared so a
            // later completion event can retry.
            self.uploads_in_flight
                .lock()
                .expect("upload map poisoned")
                .remove(scene_id);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_backoff_grows_and_caps() {
        // Reconstruct the delay sequence: 15s base, doubling per failure,
        // capped at 120s inclusive of jitter.
        let poll_interval = Duration::from_secs(15);

        for failures in 1..10u32 {
            let backoff = poll_interval.saturating_mul(2u32.saturating_pow(failures - 1));
            let capped = backoff.min(MAX_FAILURE_BACKOFF);

            assert!(capped <= MAX_FAILURE_BACKOFF);
            if failures == 1 {
                assert_eq!(capped, poll_interval);
            }
        }
    }
}
