use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use once_cell::sync::Lazy;
use prometheus::{register_int_gauge, IntGauge};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::config::AppConfig;
use crate::database::methods::DbMethods as _;
use crate::database::types::{AspectRatio, VideoUpdate};
use crate::database::Database;
use crate::polling::{PollJob, PollingCoordinator};
use crate::token_pool::{self, TokenPool};
use crate::upstream::data::scene_id_for_job;
use crate::upstream::VideoApi;

static SUBMISSION_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("submission_queue_depth", "Jobs waiting for upstream submission").unwrap()
});

/// One pending submission.
#[derive(Clone, Debug)]
pub struct QueuedJob {
    pub job_id: i64,
    pub user_id: i64,
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    pub scene_number: Option<i32>,
    pub reference_media_id: Option<String>,
}

/// In-memory FIFO feeding upstream submissions.
///
/// A single logical processor drains the queue in batches of
/// `videos_per_batch`, pacing batches by the configured delay and bounding
/// in-batch concurrency to `max_concurrent_submissions`. The queue is
/// process-wide and empty after a restart; recovery re-populates it from
/// non-terminal rows.
pub struct SubmissionQueue {
    database: Arc<Database>,
    token_pool: Arc<TokenPool>,
    video_api: Arc<VideoApi>,
    polling: Arc<PollingCoordinator>,
    config: AppConfig,
    fallback_api_key: Option<String>,
    queue: Mutex<VecDeque<QueuedJob>>,
    processing: AtomicBool,
    delay_override: Mutex<Option<Duration>>,
}

impl SubmissionQueue {
    pub fn new(
        database: Arc<Database>,
        token_pool: Arc<TokenPool>,
        video_api: Arc<VideoApi>,
        polling: Arc<PollingCoordinator>,
        config: AppConfig,
        fallback_api_key: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            database,
            token_pool,
            video_api,
            polling,
            config,
            fallback_api_key,
            queue: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
            delay_override: Mutex::new(None),
        })
    }

    /// Appends jobs and starts the processor if it is not already running.
    ///
    /// `delay_override` replaces the stored inter-batch delay for this and
    /// subsequent batches, which is how plan-specific pacing is applied.
    pub fn enqueue(self: &Arc<Self>, jobs: Vec<QueuedJob>, delay_override: Option<Duration>) {
        if jobs.is_empty() {
            return;
        }

        {
            let mut queue = self.queue.lock().expect("queue poisoned");
            queue.extend(jobs);
            SUBMISSION_QUEUE_DEPTH.set(queue.len() as i64);
        }

        if let Some(delay) = delay_override {
            *self.delay_override.lock().expect("delay poisoned") = Some(delay);
        }

        if !self.processing.swap(true, Ordering::SeqCst) {
            let this = self.clone();
            tokio::spawn(async move {
                this.process_queue().await;
            });
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("queue poisoned").len()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    async fn process_queue(self: Arc<Self>) {
        // One settings read per processing run; pacing changes apply from
        // the next run.
        let settings = self
            .database
            .with_retry(|| async { self.database.pool.get_token_settings().await })
            .await;

        let (videos_per_batch, default_delay) = match settings {
            Ok(settings) => (
                settings.videos_per_batch.max(1) as usize,
                Duration::from_secs(settings.batch_delay_seconds.max(0) as u64),
            ),
            Err(err) => {
                warn!(?err, "could not read token settings, using defaults");
                (10, Duration::from_secs(30))
            }
        };

        let delay = self
            .delay_override
            .lock()
            .expect("delay poisoned")
            .unwrap_or(default_delay);

        info!(videos_per_batch, ?delay, "submission processor started");

        loop {
            let batch: Vec<QueuedJob> = {
                let mut queue = self.queue.lock().expect("queue poisoned");
                let take = videos_per_batch.min(queue.len());
                let batch = queue.drain(..take).collect();
                SUBMISSION_QUEUE_DEPTH.set(queue.len() as i64);
                batch
            };

            if batch.is_empty() {
                self.processing.store(false, Ordering::SeqCst);

                // A producer may have appended between the drain and the
                // flag clear; reclaim the processor role if so.
                let queue_refilled = !self.queue.lock().expect("queue poisoned").is_empty();
                if queue_refilled && !self.processing.swap(true, Ordering::SeqCst) {
                    continue;
                }

                info!("submission queue drained");
                return;
            }

            for chunk in batch.chunks(self.config.max_concurrent_submissions.max(1)) {
                join_all(chunk.iter().map(|job| self.submit_job(job))).await;
            }

            let queue_is_empty = self.queue.lock().expect("queue poisoned").is_empty();
            if !queue_is_empty {
                sleep(delay).await;
            }
        }
    }

    /// Submits one job upstream and hands it to the polling coordinator.
    #[instrument(skip(self, job), fields(job_id = job.job_id), level = "debug")]
    async fn submit_job(self: &Arc<Self>, job: &QueuedJob) {
        let (api_key, token_id) = match self.token_pool.dispense_batch_token().await {
            Ok(token) => (token.token, Some(token.id)),
            Err(token_pool::Error::NoTokensAvailable) => match &self.fallback_api_key {
                Some(key) => {
                    warn!(job_id = job.job_id, "token pool empty, using fallback key");
                    (key.clone(), None)
                }
                None => {
                    self.handle_failure(job, "No active tokens available", None)
                        .await;
                    return;
                }
            },
            Err(err) => {
                error!(job_id = job.job_id, ?err, "token dispense failed");
                self.handle_failure(job, "Token dispense failed", None).await;
                return;
            }
        };

        let scene_id = scene_id_for_job(job.job_id);

        let submit = match &job.reference_media_id {
            Some(media_id) => {
                self.video_api
                    .submit_image_to_video(
                        &api_key,
                        media_id,
                        &job.prompt,
                        job.aspect_ratio,
                        &scene_id,
                        self.config.submit_timeout,
                    )
                    .await
            }
            None => {
                self.video_api
                    .submit_text_to_video(
                        &api_key,
                        &job.prompt,
                        job.aspect_ratio,
                        &scene_id,
                        self.config.submit_timeout,
                    )
                    .await
            }
        };

        let operation_name = match submit {
            Ok(name) => name,
            Err(err) => {
                warn!(job_id = job.job_id, ?err, "upstream submission failed");
                self.handle_failure(job, &format!("Submission failed: {err}"), token_id)
                    .await;
                return;
            }
        };

        let persisted = self
            .database
            .with_retry(|| async {
                self.database
                    .pool
                    .update_video_fields(
                        job.job_id,
                        None,
                        &VideoUpdate {
                            operation_name: Some(operation_name.clone()),
                            scene_id: Some(scene_id.clone()),
                            token_used: token_id,
                            ..VideoUpdate::default()
                        },
                    )
                    .await
            })
            .await;

        if let Err(err) = persisted {
            error!(job_id = job.job_id, ?err, "failed to persist operation handle");
            self.handle_failure(job, "Failed to persist submission", token_id)
                .await;
            return;
        }

        self.polling.enqueue_status_check(PollJob {
            job_id: job.job_id,
            prompt: job.prompt.clone(),
            aspect_ratio: job.aspect_ratio,
            operation_name,
            scene_id,
            api_key,
            token_id,
            reference_media_id: job.reference_media_id.clone(),
        });
    }

    /// Applies the per-job retry policy: up to `job_max_retries` delayed
    /// re-enqueues, after which the job fails for good. The token, if one
    /// was involved, gets an error recorded either way.
    async fn handle_failure(self: &Arc<Self>, job: &QueuedJob, message: &str, token_id: Option<i64>) {
        if let Some(token_id) = token_id {
            self.token_pool.record_error(token_id);
        }

        let max_retries = self.config.job_max_retries;

        let retry_count = self
            .database
            .with_retry(|| async { self.database.pool.get_video(job.job_id).await })
            .await
            .ok()
            .flatten()
            .map(|video| video.retry_count as u32);

        let Some(retry_count) = retry_count else {
            error!(job_id = job.job_id, "job row missing during failure handling");
            return;
        };

        if retry_count < max_retries {
            let next_retry = retry_count + 1;
            let annotated = format!("{message} (Retry {next_retry}/{max_retries})");

            let updated = self
                .database
                .with_retry(|| async {
                    self.database
                        .pool
                        .update_video_fields(
                            job.job_id,
                            None,
                            &VideoUpdate {
                                retry_count: Some(next_retry as i32),
                                error_message: Some(annotated.clone()),
                                ..VideoUpdate::default()
                            },
                        )
                        .await
                })
                .await;

            if let Err(err) = updated {
                error!(job_id = job.job_id, ?err, "failed to persist retry state");
                return;
            }

            info!(
                job_id = job.job_id,
                retry = next_retry,
                max = max_retries,
                "scheduling submission retry"
            );

            let this = self.clone();
            let job = job.clone();
            let delay = self.config.retry_delay;
            tokio::spawn(async move {
                sleep(delay).await;
                this.enqueue(vec![job], None);
            });
        } else {
            let terminal = format!("{message} (Max retries reached)");

            let result = self
                .database
                .with_retry(|| async {
                    self.database
                        .pool
                        .mark_video_failed(job.job_id, &terminal)
                        .await
                })
                .await;

            if let Err(err) = result {
                error!(job_id = job.job_id, ?err, "failed to mark job as failed");
            }
        }
    }
}
