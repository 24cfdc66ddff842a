use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::database::methods::DbMethods as _;
use crate::database::types::{ApiToken, AspectRatio, JobStatus, User, VideoJob, VideoUpdate};
use crate::database::Database;
use crate::media::MediaUploader;
use crate::plan::{PlanEnforcer, Tool};
use crate::polling::{PollJob, PollingCoordinator};
use crate::submission::{QueuedJob, SubmissionQueue};
use crate::token_pool::{self, TokenPool};
use crate::upstream::data::{scene_id_for_job, VideoStatus};
use crate::upstream::VideoApi;

pub mod error;

pub use error::Error;

/// Prompt length bounds accepted for any submission.
const PROMPT_MIN_LEN: usize = 10;
const PROMPT_MAX_LEN: usize = 2000;

/// Hard cap on prompts per bulk request, regardless of plan.
const MAX_BULK_PROMPTS: usize = 100;

/// Result of a synchronous single submission.
#[derive(Clone, Debug)]
pub struct SingleSubmission {
    pub job_id: i64,
    pub operation_name: String,
    pub scene_id: String,
    pub token_id: Option<i64>,
}

/// Single-shot status check result, outside the coordinator loop.
#[derive(Clone, Debug)]
pub struct StatusReport {
    pub status: JobStatus,
    pub video_url: Option<String>,
    pub error_message: Option<String>,
}

/// The orchestrator core, wired together at startup.
///
/// Owns no HTTP transport: the routing/auth layer is an external
/// collaborator calling these methods.
pub struct App {
    pub database: Arc<Database>,
    pub token_pool: Arc<TokenPool>,
    pub video_api: Arc<VideoApi>,
    pub media: Arc<MediaUploader>,
    pub polling: Arc<PollingCoordinator>,
    pub submission: Arc<SubmissionQueue>,
    pub config: Config,
}

impl App {
    #[instrument(name = "App::new", level = "debug", skip_all)]
    pub async fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let database = Arc::new(Database::new(&config.database).await?);
        let token_pool = Arc::new(TokenPool::new(database.clone(), &config.app));
        let video_api = Arc::new(VideoApi::new(&config.upstream)?);
        let media = Arc::new(MediaUploader::new(&config.media)?);

        let polling = PollingCoordinator::new(
            database.clone(),
            token_pool.clone(),
            video_api.clone(),
            media.clone(),
            config.app.clone(),
        );

        let fallback_api_key = config
            .upstream
            .fallback_api_key
            .as_ref()
            .map(|key| key.expose().to_string());

        let submission = SubmissionQueue::new(
            database.clone(),
            token_pool.clone(),
            video_api.clone(),
            polling.clone(),
            config.app.clone(),
            fallback_api_key,
        );

        Ok(Arc::new(Self {
            database,
            token_pool,
            video_api,
            media,
            polling,
            submission,
            config,
        }))
    }

    // ------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------

    /// Creates jobs for a batch of prompts and feeds them into the
    /// submission queue with the user's plan pacing.
    #[instrument(level = "debug", skip(self, prompts))]
    pub async fn submit_bulk(
        &self,
        user_id: i64,
        prompts: Vec<String>,
        aspect_ratio: AspectRatio,
    ) -> Result<Vec<i64>, Error> {
        let user = self.require_user(user_id).await?;

        if prompts.is_empty() || prompts.len() > MAX_BULK_PROMPTS {
            return Err(Error::Validation(format!(
                "Between 1 and {MAX_BULK_PROMPTS} prompts are required."
            )));
        }

        for prompt in &prompts {
            validate_prompt(prompt)?;
        }

        let decision = PlanEnforcer::can_bulk_generate(&user, prompts.len(), Utc::now());
        if !decision.allowed {
            return Err(Error::Authorization(
                decision.reason.unwrap_or_else(|| "Not allowed".to_string()),
            ));
        }

        let bulk = PlanEnforcer::batch_config(&user);

        let mut jobs = Vec::with_capacity(prompts.len());
        for (scene_number, prompt) in prompts.iter().enumerate() {
            let video = self
                .database
                .with_retry(|| async {
                    self.database
                        .pool
                        .insert_video(user_id, prompt, aspect_ratio, None)
                        .await
                })
                .await?;

            jobs.push(QueuedJob {
                job_id: video.id,
                user_id,
                prompt: prompt.clone(),
                aspect_ratio,
                scene_number: Some(scene_number as i32),
                reference_media_id: None,
            });
        }

        let job_ids: Vec<i64> = jobs.iter().map(|job| job.job_id).collect();

        self.database
            .with_retry(|| async { self.database.pool.mark_videos_queued(&job_ids).await })
            .await?;

        self.database
            .with_retry(|| async {
                self.database
                    .pool
                    .increment_daily_count(user_id, job_ids.len() as i32)
                    .await
            })
            .await?;

        info!(
            user_id,
            jobs = job_ids.len(),
            delay_seconds = bulk.delay_seconds,
            "bulk submission accepted"
        );

        self.submission
            .enqueue(jobs, Some(Duration::from_secs(bulk.delay_seconds)));

        Ok(job_ids)
    }

    /// Synchronous single submission: returns the upstream handle and starts
    /// polling internally.
    #[instrument(level = "debug", skip(self, prompt))]
    pub async fn submit_single(
        &self,
        user_id: i64,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<SingleSubmission, Error> {
        let user = self.require_user(user_id).await?;
        validate_prompt(prompt)?;
        self.require_tool(&user, Tool::Veo)?;
        self.require_quota(&user)?;

        let (api_key, token_id) = self.dispense_or_fallback().await?;

        let video = self
            .database
            .with_retry(|| async {
                self.database
                    .pool
                    .insert_video(user_id, prompt, aspect_ratio, None)
                    .await
            })
            .await?;

        let scene_id = scene_id_for_job(video.id);

        let operation_name = match self
            .video_api
            .submit_text_to_video(
                &api_key,
                prompt,
                aspect_ratio,
                &scene_id,
                self.config.app.submit_timeout,
            )
            .await
        {
            Ok(name) => name,
            Err(err) => {
                if let Some(token_id) = token_id {
                    self.token_pool.record_error(token_id);
                }
                self.database
                    .with_retry(|| async {
                        self.database
                            .pool
                            .mark_video_failed(video.id, &format!("Submission failed: {err}"))
                            .await
                    })
                    .await?;
                return Err(err.into());
            }
        };

        self.accept_submission(&video, &operation_name, &scene_id, token_id)
            .await?;

        self.database
            .with_retry(|| async { self.database.pool.increment_daily_count(user_id, 1).await })
            .await?;

        self.polling.enqueue_status_check(PollJob {
            job_id: video.id,
            prompt: prompt.to_string(),
            aspect_ratio,
            operation_name: operation_name.clone(),
            scene_id: scene_id.clone(),
            api_key,
            token_id,
            reference_media_id: None,
        });

        Ok(SingleSubmission {
            job_id: video.id,
            operation_name,
            scene_id,
            token_id,
        })
    }

    /// Two-stage image-to-video submission: the reference image is uploaded
    /// upstream (and re-hosted for the job record), then the job is
    /// submitted against a reference-image-capable model.
    #[instrument(level = "debug", skip(self, image_bytes, prompt))]
    pub async fn submit_image_to_video(
        &self,
        user_id: i64,
        image_bytes: Bytes,
        mime_type: &str,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<SingleSubmission, Error> {
        let user = self.require_user(user_id).await?;
        validate_prompt(prompt)?;
        self.require_tool(&user, Tool::ImageToVideo)?;
        self.require_quota(&user)?;

        let (api_key, token_id) = self.dispense_or_fallback().await?;

        let media_id = self
            .video_api
            .upload_image(
                &api_key,
                &image_bytes,
                mime_type,
                self.config.app.submit_timeout,
            )
            .await?;

        let reference_image_url = match self.media.upload_image(image_bytes, mime_type).await {
            Ok(url) => Some(url),
            Err(err) => {
                // The job can proceed on the upstream media id alone.
                warn!(user_id, ?err, "reference image re-hosting failed");
                None
            }
        };

        let video = self
            .database
            .with_retry(|| async {
                self.database
                    .pool
                    .insert_video(user_id, prompt, aspect_ratio, reference_image_url.as_deref())
                    .await
            })
            .await?;

        let scene_id = scene_id_for_job(video.id);

        let operation_name = match self
            .video_api
            .submit_image_to_video(
                &api_key,
                &media_id,
                prompt,
                aspect_ratio,
                &scene_id,
                self.config.app.submit_timeout,
            )
            .await
        {
            Ok(name) => name,
            Err(err) => {
                if let Some(token_id) = token_id {
                    self.token_pool.record_error(token_id);
                }
                self.database
                    .with_retry(|| async {
                        self.database
                            .pool
                            .mark_video_failed(video.id, &format!("Submission failed: {err}"))
                            .await
                    })
                    .await?;
                return Err(err.into());
            }
        };

        self.accept_submission(&video, &operation_name, &scene_id, token_id)
            .await?;

        self.database
            .with_retry(|| async { self.database.pool.increment_daily_count(user_id, 1).await })
            .await?;

        self.polling.enqueue_status_check(PollJob {
            job_id: video.id,
            prompt: prompt.to_string(),
            aspect_ratio,
            operation_name: operation_name.clone(),
            scene_id: scene_id.clone(),
            api_key,
            token_id,
            reference_media_id: Some(media_id),
        });

        Ok(SingleSubmission {
            job_id: video.id,
            operation_name,
            scene_id,
            token_id,
        })
    }

    /// Re-submits an existing job. In a bulk context the token is picked by
    /// scene number so parallel regenerations spread over the pool;
    /// otherwise the batch dispenser is used.
    #[instrument(level = "debug", skip(self, prompt))]
    pub async fn regenerate(
        &self,
        user_id: i64,
        job_id: i64,
        prompt: &str,
        aspect_ratio: AspectRatio,
        scene_number: Option<i32>,
    ) -> Result<SingleSubmission, Error> {
        let user = self.require_user(user_id).await?;
        validate_prompt(prompt)?;
        self.require_quota(&user)?;

        let video = self
            .database
            .with_retry(|| async { self.database.pool.get_video_for_user(job_id, user_id).await })
            .await?
            .ok_or(Error::JobNotFound)?;

        let (api_key, token_id) = match scene_number {
            Some(scene_number) => self.token_by_scene_number(scene_number).await?,
            None => self.dispense_or_fallback().await?,
        };

        let scene_id = scene_id_for_job(video.id);

        let operation_name = self
            .video_api
            .submit_text_to_video(
                &api_key,
                prompt,
                aspect_ratio,
                &scene_id,
                self.config.app.submit_timeout,
            )
            .await
            .map_err(|err| {
                if let Some(token_id) = token_id {
                    self.token_pool.record_error(token_id);
                }
                Error::from(err)
            })?;

        self.database
            .with_retry(|| async {
                self.database
                    .pool
                    .update_video_fields(
                        video.id,
                        None,
                        &VideoUpdate {
                            status: Some(JobStatus::Queued),
                            operation_name: Some(operation_name.clone()),
                            scene_id: Some(scene_id.clone()),
                            token_used: token_id,
                            retry_count: Some(0),
                            ..VideoUpdate::default()
                        },
                    )
                    .await
            })
            .await?;

        self.polling.enqueue_status_check(PollJob {
            job_id: video.id,
            prompt: prompt.to_string(),
            aspect_ratio,
            operation_name: operation_name.clone(),
            scene_id: scene_id.clone(),
            api_key,
            token_id,
            reference_media_id: None,
        });

        Ok(SingleSubmission {
            job_id: video.id,
            operation_name,
            scene_id,
            token_id,
        })
    }

    /// Single-shot status check outside the coordinator. May complete the
    /// job (including the deduplicated upload) if the artifact is ready.
    #[instrument(level = "debug", skip(self))]
    pub async fn check_status(
        &self,
        operation_name: &str,
        scene_id: &str,
        token_id: Option<i64>,
        job_id: Option<i64>,
    ) -> Result<StatusReport, Error> {
        // A terminal row already holds the answer; do not re-poll upstream.
        if let Some(job_id) = job_id {
            let video = self
                .database
                .with_retry(|| async { self.database.pool.get_video(job_id).await })
                .await?
                .ok_or(Error::JobNotFound)?;

            if video.status.is_terminal() {
                return Ok(StatusReport {
                    status: video.status,
                    video_url: video.video_url,
                    error_message: video.error_message,
                });
            }
        }

        let api_key = self.status_check_credential(token_id).await?;

        let status = self
            .video_api
            .check_status(
                &api_key,
                operation_name,
                scene_id,
                self.config.app.status_check_timeout,
            )
            .await?;

        match status.outcome() {
            VideoStatus::Complete { video_url } => {
                let hosted = self
                    .polling
                    .upload_once(scene_id, &video_url)
                    .await
                    .map_err(|message| Error::Internal(anyhow::anyhow!(message)))?;

                if let Some(job_id) = job_id {
                    self.database
                        .with_retry(|| async {
                            self.database.pool.mark_video_completed(job_id, &hosted).await
                        })
                        .await?;
                }

                Ok(StatusReport {
                    status: JobStatus::Completed,
                    video_url: Some(hosted),
                    error_message: None,
                })
            }
            VideoStatus::Error { message } => {
                if let Some(token_id) = token_id {
                    self.token_pool.record_error(token_id);
                }

                if let Some(job_id) = job_id {
                    self.database
                        .with_retry(|| async {
                            self.database.pool.mark_video_failed(job_id, &message).await
                        })
                        .await?;
                }

                Ok(StatusReport {
                    status: JobStatus::Failed,
                    video_url: None,
                    error_message: Some(message),
                })
            }
            VideoStatus::Pending => Ok(StatusReport {
                status: JobStatus::Queued,
                video_url: None,
                error_message: None,
            }),
        }
    }

    /// Generates a still image for the `textToImage` tool and re-hosts it.
    #[instrument(level = "debug", skip(self, prompt))]
    pub async fn generate_image(&self, user_id: i64, prompt: &str) -> Result<String, Error> {
        let user = self.require_user(user_id).await?;
        validate_prompt(prompt)?;
        self.require_tool(&user, Tool::TextToImage)?;

        let (api_key, token_id) = self.dispense_or_fallback().await?;

        let encoded = match self
            .video_api
            .generate_image(&api_key, prompt, self.config.app.submit_timeout)
            .await
        {
            Ok(encoded) => encoded,
            Err(err) => {
                if let Some(token_id) = token_id {
                    self.token_pool.record_error(token_id);
                }
                return Err(err.into());
            }
        };

        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|err| Error::Internal(anyhow::anyhow!("invalid image payload: {err}")))?;

        let hosted = self.media.upload_image(Bytes::from(bytes), "image/png").await?;

        Ok(hosted)
    }

    // ------------------------------------------------------------------
    // Job history
    // ------------------------------------------------------------------

    pub async fn user_videos(&self, user_id: i64, limit: i64) -> Result<Vec<VideoJob>, Error> {
        Ok(self
            .database
            .with_retry(|| async { self.database.pool.get_user_videos(user_id, limit).await })
            .await?)
    }

    // ------------------------------------------------------------------
    // Token administration
    // ------------------------------------------------------------------

    pub async fn replace_tokens(&self, raw_tokens: Vec<String>) -> Result<Vec<i64>, Error> {
        let ids = self.database.replace_all_tokens(&raw_tokens).await?;
        info!(count = ids.len(), "replaced token pool");
        Ok(ids)
    }

    pub async fn add_token(&self, token: String, label: String) -> Result<i64, Error> {
        Ok(self.database.pool.insert_token(&token, &label).await?)
    }

    pub async fn list_tokens(&self) -> Result<Vec<ApiToken>, Error> {
        Ok(self.database.pool.get_all_tokens().await?)
    }

    pub async fn set_token_active(&self, token_id: i64, is_active: bool) -> Result<(), Error> {
        Ok(self.database.pool.set_token_active(token_id, is_active).await?)
    }

    pub async fn remove_token(&self, token_id: i64) -> Result<(), Error> {
        Ok(self.database.pool.delete_token(token_id).await?)
    }

    pub async fn update_batch_settings(
        &self,
        videos_per_batch: i32,
        batch_delay_seconds: i32,
    ) -> Result<(), Error> {
        if videos_per_batch < 1 || batch_delay_seconds < 0 {
            return Err(Error::Validation(
                "videos_per_batch must be >= 1 and batch_delay_seconds >= 0".to_string(),
            ));
        }

        Ok(self
            .database
            .pool
            .update_batch_settings(videos_per_batch, batch_delay_seconds)
            .await?)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn require_user(&self, user_id: i64) -> Result<User, Error> {
        self.database
            .with_retry(|| async { self.database.pool.get_user(user_id).await })
            .await?
            .ok_or(Error::UserNotFound)
    }

    fn require_tool(&self, user: &User, tool: Tool) -> Result<(), Error> {
        let decision = PlanEnforcer::can_access_tool(user, tool, Utc::now());
        if !decision.allowed {
            return Err(Error::Authorization(
                decision.reason.unwrap_or_else(|| "Not allowed".to_string()),
            ));
        }
        Ok(())
    }

    fn require_quota(&self, user: &User) -> Result<(), Error> {
        let decision = PlanEnforcer::can_generate_video(user, Utc::now());
        if !decision.allowed {
            return Err(Error::Authorization(
                decision.reason.unwrap_or_else(|| "Not allowed".to_string()),
            ));
        }
        Ok(())
    }

    /// Batch-mode dispense with the configured environment fallback.
    async fn dispense_or_fallback(&self) -> Result<(String, Option<i64>), Error> {
        match self.token_pool.dispense_batch_token().await {
            Ok(token) => Ok((token.token, Some(token.id))),
            Err(token_pool::Error::NoTokensAvailable) => {
                match &self.config.upstream.fallback_api_key {
                    Some(key) => {
                        warn!("token pool empty, using fallback key");
                        Ok((key.expose().to_string(), None))
                    }
                    None => Err(Error::NoTokensAvailable),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Bulk-context token selection: scene number modulo the active set.
    async fn token_by_scene_number(
        &self,
        scene_number: i32,
    ) -> Result<(String, Option<i64>), Error> {
        let active = self
            .database
            .with_retry(|| async { self.database.pool.get_active_tokens().await })
            .await?;

        let available: Vec<_> = active
            .into_iter()
            .filter(|t| !self.token_pool.is_in_cooldown(t.id))
            .collect();

        if available.is_empty() {
            return self.dispense_or_fallback().await;
        }

        let index = scene_number.max(0) as usize % available.len();
        let token = &available[index];

        self.database
            .with_retry(|| async { self.database.pool.touch_token_last_used(token.id).await })
            .await?;

        Ok((token.token.clone(), Some(token.id)))
    }

    /// Credential for a one-off status check: the job's own token when known
    /// and usable, otherwise an LRU rotation token, otherwise the fallback.
    async fn status_check_credential(&self, token_id: Option<i64>) -> Result<String, Error> {
        if let Some(token_id) = token_id {
            let token = self
                .database
                .with_retry(|| async { self.database.pool.get_token(token_id).await })
                .await?;

            if let Some(token) = token {
                if token.is_active && !self.token_pool.is_in_cooldown(token.id) {
                    return Ok(token.token);
                }
            }
        }

        if let Some(token) = self.token_pool.next_rotation_token().await? {
            return Ok(token.token);
        }

        match &self.config.upstream.fallback_api_key {
            Some(key) => Ok(key.expose().to_string()),
            None => Err(Error::NoTokensAvailable),
        }
    }

    async fn accept_submission(
        &self,
        video: &VideoJob,
        operation_name: &str,
        scene_id: &str,
        token_id: Option<i64>,
    ) -> Result<(), Error> {
        Ok(self
            .database
            .with_retry(|| async {
                self.database
                    .pool
                    .update_video_fields(
                        video.id,
                        None,
                        &VideoUpdate {
                            status: Some(JobStatus::Queued),
                            operation_name: Some(operation_name.to_string()),
                            scene_id: Some(scene_id.to_string()),
                            token_used: token_id,
                            ..VideoUpdate::default()
                        },
                    )
                    .await
            })
            .await?)
    }
}

fn validate_prompt(prompt: &str) -> Result<(), Error> {
    let len = prompt.trim().len();

    if len < PROMPT_MIN_LEN {
        return Err(Error::Validation(format!(
            "Prompt must be at least {PROMPT_MIN_LEN} characters."
        )));
    }

    if len > PROMPT_MAX_LEN {
        return Err(Error::Validation(format!(
            "Prompt must be at most {PROMPT_MAX_LEN} characters."
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_length_bounds() {
        assert!(validate_prompt("short").is_err());
        assert!(validate_prompt("a prompt that is long enough").is_ok());
        assert!(validate_prompt(&"x".repeat(2001)).is_err());
        assert!(validate_prompt(&"x".repeat(2000)).is_ok());
    }

    #[test]
    fn whitespace_does_not_count_toward_length() {
        assert!(validate_prompt("   tiny    ").is_err());
    }
}
