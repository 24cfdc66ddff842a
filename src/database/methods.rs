use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Acquire, Postgres, Row};
use tracing::instrument;

use super::types::{ApiToken, JobStatus, PlanTier, TokenSettings, User, VideoJob, VideoUpdate};
use super::{Database, Error};
use crate::database::types::AspectRatio;

/// Individual and composable queries against the store.
///
/// Each method is a single atomic query (unless noted otherwise) and can be
/// composed within a transaction.
#[async_trait]
pub trait DbMethods<'c>: Acquire<'c, Database = Postgres> + Send + Sized {
    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    #[instrument(skip(self), level = "debug")]
    async fn get_user(self, id: i64) -> Result<Option<User>, Error> {
        let mut conn = self.acquire().await?;

        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT * FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(user)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_user_by_email(self, email: &str) -> Result<Option<User>, Error> {
        let mut conn = self.acquire().await?;

        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT * FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(user)
    }

    #[instrument(skip(self, password_hash), level = "debug")]
    async fn insert_user(
        self,
        email: &str,
        password_hash: &str,
        role: super::types::UserRole,
    ) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO users (email, password_hash, role)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(email)
        .bind(password_hash)
        .bind(<&str>::from(role))
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<i64, _>(0))
    }

    #[instrument(skip(self), level = "debug")]
    async fn update_user_plan(
        self,
        user_id: i64,
        tier: PlanTier,
        started_at: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE users
            SET    plan_tier = $2, plan_started_at = $3, plan_expires_at = $4
            WHERE  id = $1
            "#,
        )
        .bind(user_id)
        .bind(<&str>::from(tier))
        .bind(started_at)
        .bind(expires_at)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Atomic SQL increment so the counter is correct under parallel writers.
    #[instrument(skip(self), level = "debug")]
    async fn increment_daily_count(self, user_id: i64, by: i32) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE users
            SET    daily_videos_generated = daily_videos_generated + $2
            WHERE  id = $1
            "#,
        )
        .bind(user_id)
        .bind(by)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_users(self) -> Result<Vec<User>, Error> {
        let mut conn = self.acquire().await?;

        let users = sqlx::query_as::<_, User>(
            r#"
            SELECT * FROM users
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        Ok(users)
    }

    /// Zeroes counters for users whose last reset happened before `today`.
    #[instrument(skip(self), level = "debug")]
    async fn reset_expired_daily_counts(self, today: NaiveDate) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE users
            SET    daily_videos_generated = 0, last_reset_date = $1
            WHERE  last_reset_date < $1
            "#,
        )
        .bind(today)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    #[instrument(skip(self, token), level = "debug")]
    async fn insert_token(self, token: &str, label: &str) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO tokens (token, label)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(token)
        .bind(label)
        .fetch_one(&mut *conn)
        .await
        .map_err(unique_violation_as_duplicate)?;

        Ok(row.get::<i64, _>(0))
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_token(self, id: i64) -> Result<Option<ApiToken>, Error> {
        let mut conn = self.acquire().await?;

        let token = sqlx::query_as::<_, ApiToken>(
            r#"
            SELECT * FROM tokens
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(token)
    }

    /// Active tokens in creation order, the order the rotation cursor walks.
    #[instrument(skip(self), level = "debug")]
    async fn get_active_tokens(self) -> Result<Vec<ApiToken>, Error> {
        let mut conn = self.acquire().await?;

        let tokens = sqlx::query_as::<_, ApiToken>(
            r#"
            SELECT * FROM tokens
            WHERE is_active
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        Ok(tokens)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_all_tokens(self) -> Result<Vec<ApiToken>, Error> {
        let mut conn = self.acquire().await?;

        let tokens = sqlx::query_as::<_, ApiToken>(
            r#"
            SELECT * FROM tokens
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        Ok(tokens)
    }

    #[instrument(skip(self), level = "debug")]
    async fn set_token_active(self, id: i64, is_active: bool) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE tokens
            SET    is_active = $2
            WHERE  id = $1
            "#,
        )
        .bind(id)
        .bind(is_active)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_token(self, id: i64) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query("DELETE FROM tokens WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn count_tokens(self) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query("SELECT COUNT(*) FROM tokens")
            .fetch_one(&mut *conn)
            .await?;

        Ok(row.get::<i64, _>(0))
    }

    /// Locks the token row exclusively so concurrent dispensers serialize.
    #[instrument(skip(self), level = "debug")]
    async fn lock_token(self, id: i64) -> Result<Option<ApiToken>, Error> {
        let mut conn = self.acquire().await?;

        let token = sqlx::query_as::<_, ApiToken>(
            r#"
            SELECT * FROM tokens
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(token)
    }

    /// Counts one dispense against the token. `batch_started_at` is kept if
    /// already set within the current batch.
    #[instrument(skip(self), level = "debug")]
    async fn record_token_dispense(self, id: i64) -> Result<ApiToken, Error> {
        let mut conn = self.acquire().await?;

        let token = sqlx::query_as::<_, ApiToken>(
            r#"
            UPDATE tokens
            SET    current_batch_count = current_batch_count + 1,
                   total_generated = total_generated + 1,
                   batch_started_at = COALESCE(batch_started_at, CURRENT_TIMESTAMP),
                   last_used_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(token)
    }

    /// Closes out a completed batch on the token.
    #[instrument(skip(self), level = "debug")]
    async fn reset_token_batch(self, id: i64) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE tokens
            SET    current_batch_count = 0, batch_started_at = NULL
            WHERE  id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn touch_token_last_used(self, id: i64) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE tokens
            SET    last_used_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Token settings
    // ------------------------------------------------------------------

    #[instrument(skip(self), level = "debug")]
    async fn get_token_settings(self) -> Result<TokenSettings, Error> {
        let mut conn = self.acquire().await?;

        let settings = sqlx::query_as::<_, TokenSettings>(
            r#"
            SELECT last_used_token_index, videos_per_batch, batch_delay_seconds
            FROM token_settings
            WHERE id = 1
            "#,
        )
        .fetch_optional(&mut *conn)
        .await?;

        settings.ok_or(Error::MissingTokenSettings)
    }

    #[instrument(skip(self), level = "debug")]
    async fn update_last_used_token_index(self, index: i32) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE token_settings
            SET    last_used_token_index = $1
            WHERE  id = 1
            "#,
        )
        .bind(index)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn update_batch_settings(
        self,
        videos_per_batch: i32,
        batch_delay_seconds: i32,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE token_settings
            SET    videos_per_batch = $1, batch_delay_seconds = $2
            WHERE  id = 1
            "#,
        )
        .bind(videos_per_batch)
        .bind(batch_delay_seconds)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Videos
    // ------------------------------------------------------------------

    #[instrument(skip(self, prompt), level = "debug")]
    async fn insert_video(
        self,
        user_id: i64,
        prompt: &str,
        aspect_ratio: AspectRatio,
        reference_image_url: Option<&str>,
    ) -> Result<VideoJob, Error> {
        let mut conn = self.acquire().await?;

        let video = sqlx::query_as::<_, VideoJob>(
            r#"
            INSERT INTO videos (user_id, prompt, aspect_ratio, status, reference_image_url)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(prompt)
        .bind(<&str>::from(aspect_ratio))
        .bind(<&str>::from(JobStatus::Pending))
        .bind(reference_image_url)
        .fetch_one(&mut *conn)
        .await?;

        Ok(video)
    }

    /// Flips freshly created rows to `queued` as the submission queue
    /// accepts them.
    #[instrument(skip(self), level = "debug")]
    async fn mark_videos_queued(self, ids: &[i64]) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE videos
            SET    status = $2, updated_at = CURRENT_TIMESTAMP
            WHERE  id = ANY($1)
            AND    status = $3
            "#,
        )
        .bind(ids)
        .bind(<&str>::from(JobStatus::Queued))
        .bind(<&str>::from(JobStatus::Pending))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_video(self, id: i64) -> Result<Option<VideoJob>, Error> {
        let mut conn = self.acquire().await?;

        let video = sqlx::query_as::<_, VideoJob>(
            r#"
            SELECT * FROM videos
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(video)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_video_for_user(self, id: i64, user_id: i64) -> Result<Option<VideoJob>, Error> {
        let mut conn = self.acquire().await?;

        let video = sqlx::query_as::<_, VideoJob>(
            r#"
            SELECT * FROM videos
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(video)
    }

    /// Job history listing, newest first.
    #[instrument(skip(self), level = "debug")]
    async fn get_user_videos(self, user_id: i64, limit: i64) -> Result<Vec<VideoJob>, Error> {
        let mut conn = self.acquire().await?;

        let videos = sqlx::query_as::<_, VideoJob>(
            r#"
            SELECT * FROM videos
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

        Ok(videos)
    }

    /// Partial update. Absent fields are left untouched; `updated_at` is
    /// always set server-side.
    #[instrument(skip(self, update), level = "debug")]
    async fn update_video_fields(
        self,
        id: i64,
        user_id: Option<i64>,
        update: &VideoUpdate,
    ) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE videos
            SET    status = COALESCE($3, status),
                   video_url = COALESCE($4, video_url),
                   operation_name = COALESCE($5, operation_name),
                   scene_id = COALESCE($6, scene_id),
                   token_used = COALESCE($7, token_used),
                   retry_count = COALESCE($8, retry_count),
                   error_message = COALESCE($9, error_message),
                   metadata = COALESCE($10, metadata),
                   updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            AND    ($2::BIGINT IS NULL OR user_id = $2)
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(update.status.map(<&str>::from))
        .bind(update.video_url.as_deref())
        .bind(update.operation_name.as_deref())
        .bind(update.scene_id.as_deref())
        .bind(update.token_used)
        .bind(update.retry_count)
        .bind(update.error_message.as_deref())
        .bind(update.metadata.as_deref())
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::VideoNotFound { id });
        }

        Ok(())
    }

    /// Heartbeat write so the housekeeper does not expire a job that is
    /// still being polled. Terminal rows are never touched.
    #[instrument(skip(self), level = "debug")]
    async fn touch_video(self, id: i64) -> Result<(), Error> {
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE videos
            SET    updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            AND    status IN ($2, $3)
            "#,
        )
        .bind(id)
        .bind(<&str>::from(JobStatus::Pending))
        .bind(<&str>::from(JobStatus::Queued))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Terminal completion. A no-op when the row is already terminal, which
    /// keeps completion idempotent under duplicate status-check paths.
    #[instrument(skip(self), level = "debug")]
    async fn mark_video_completed(self, id: i64, video_url: &str) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE videos
            SET    status = $2, video_url = $3, error_message = NULL,
                   updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            AND    status NOT IN ($4, $5)
            "#,
        )
        .bind(id)
        .bind(<&str>::from(JobStatus::Completed))
        .bind(video_url)
        .bind(<&str>::from(JobStatus::Completed))
        .bind(<&str>::from(JobStatus::Failed))
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Terminal failure. Same terminal guard as `mark_video_completed`.
    #[instrument(skip(self, error_message), level = "debug")]
    async fn mark_video_failed(self, id: i64, error_message: &str) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let result = sqlx::query(
            r#"
            UPDATE videos
            SET    status = $2, error_message = $3, updated_at = CURRENT_TIMESTAMP
            WHERE  id = $1
            AND    status NOT IN ($4, $5)
            "#,
        )
        .bind(id)
        .bind(<&str>::from(JobStatus::Failed))
        .bind(error_message)
        .bind(<&str>::from(JobStatus::Completed))
        .bind(<&str>::from(JobStatus::Failed))
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Non-terminal jobs whose last write predates `cutoff`.
    #[instrument(skip(self), level = "debug")]
    async fn get_stale_processing_videos(
        self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<VideoJob>, Error> {
        let mut conn = self.acquire().await?;

        let videos = sqlx::query_as::<_, VideoJob>(
            r#"
            SELECT * FROM videos
            WHERE status IN ($1, $2)
            AND   updated_at < $3
            ORDER BY id ASC
            "#,
        )
        .bind(<&str>::from(JobStatus::Pending))
        .bind(<&str>::from(JobStatus::Queued))
        .bind(cutoff)
        .fetch_all(&mut *conn)
        .await?;

        Ok(videos)
    }

    /// Queued jobs that already hold an upstream operation handle; these are
    /// resumable by the polling coordinator after a restart.
    #[instrument(skip(self), level = "debug")]
    async fn get_resumable_videos(self) -> Result<Vec<VideoJob>, Error> {
        let mut conn = self.acquire().await?;

        let videos = sqlx::query_as::<_, VideoJob>(
            r#"
            SELECT * FROM videos
            WHERE status = $1
            AND   operation_name IS NOT NULL
            ORDER BY id ASC
            "#,
        )
        .bind(<&str>::from(JobStatus::Queued))
        .fetch_all(&mut *conn)
        .await?;

        Ok(videos)
    }

    #[instrument(skip(self), level = "debug")]
    async fn count_videos_by_status(self, status: JobStatus) -> Result<i64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FROM videos
            WHERE status = $1
            "#,
        )
        .bind(<&str>::from(status))
        .fetch_one(&mut *conn)
        .await?;

        Ok(row.get::<i64, _>(0))
    }
}

impl<'c, T> DbMethods<'c> for T where T: Acquire<'c, Database = Postgres> + Send + Sized {}

fn unique_violation_as_duplicate(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return Error::DuplicateToken;
        }
    }

    Error::Database(err)
}

impl Database {
    /// Replaces the whole token set in one transaction: usage references on
    /// jobs are nullified, all tokens deleted, and the new ones inserted
    /// with auto-generated labels. Duplicate token strings are rejected.
    #[instrument(skip(self, raw_tokens), level = "debug")]
    pub async fn replace_all_tokens(&self, raw_tokens: &[String]) -> Result<Vec<i64>, Error> {
        let mut deduped = Vec::with_capacity(raw_tokens.len());
        for raw in raw_tokens {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            if deduped.contains(&trimmed) {
                return Err(Error::DuplicateToken);
            }
            deduped.push(trimmed);
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE videos SET token_used = NULL")
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM tokens").execute(&mut *tx).await?;

        let mut ids = Vec::with_capacity(deduped.len());
        for (i, raw) in deduped.iter().enumerate() {
            let label = format!("Token {}", i + 1);
            let id = (&mut *tx).insert_token(raw, &label).await?;
            ids.push(id);
        }

        tx.commit().await?;

        Ok(ids)
    }
}
