use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown value")]
pub struct UnknownValue;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum UserRole {
    Regular,
    Admin,
}

impl FromStr for UserRole {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(Self::Regular),
            "admin" => Ok(Self::Admin),
            _ => Err(UnknownValue),
        }
    }
}

impl From<UserRole> for &str {
    fn from(role: UserRole) -> Self {
        match role {
            UserRole::Regular => "regular",
            UserRole::Admin => "admin",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum PlanTier {
    Free,
    Scale,
    Empire,
}

impl FromStr for PlanTier {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "scale" => Ok(Self::Scale),
            "empire" => Ok(Self::Empire),
            _ => Err(UnknownValue),
        }
    }
}

impl From<PlanTier> for &str {
    fn from(tier: PlanTier) -> Self {
        match tier {
            PlanTier::Free => "free",
            PlanTier::Scale => "scale",
            PlanTier::Empire => "empire",
        }
    }
}

/// Lifecycle of a video job.
///
/// `pending` on creation, `queued` once accepted by the submission queue,
/// then terminal `completed`/`failed`. Terminal rows are never mutated again.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Queued,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(UnknownValue),
        }
    }
}

impl From<JobStatus> for &str {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum AspectRatio {
    Landscape,
    Portrait,
}

impl FromStr for AspectRatio {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "landscape" => Ok(Self::Landscape),
            "portrait" => Ok(Self::Portrait),
            _ => Err(UnknownValue),
        }
    }
}

impl From<AspectRatio> for &str {
    fn from(ratio: AspectRatio) -> Self {
        match ratio {
            AspectRatio::Landscape => "landscape",
            AspectRatio::Portrait => "portrait",
        }
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub role: UserRole,
    pub plan_tier: PlanTier,
    pub plan_started_at: Option<DateTime<Utc>>,
    pub plan_expires_at: Option<DateTime<Utc>>,
    pub daily_videos_generated: i32,
    pub last_reset_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for User {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            role: parse_column(row, "role")?,
            plan_tier: parse_column(row, "plan_tier")?,
            plan_started_at: row.try_get("plan_started_at")?,
            plan_expires_at: row.try_get("plan_expires_at")?,
            daily_videos_generated: row.try_get("daily_videos_generated")?,
            last_reset_date: row.try_get("last_reset_date")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// One upstream API credential with its batch accounting.
#[derive(Clone, Debug)]
pub struct ApiToken {
    pub id: i64,
    pub token: String,
    pub label: String,
    pub is_active: bool,
    pub current_batch_count: i32,
    pub total_generated: i64,
    pub batch_started_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ApiToken {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            token: row.try_get("token")?,
            label: row.try_get("label")?,
            is_active: row.try_get("is_active")?,
            current_batch_count: row.try_get("current_batch_count")?,
            total_generated: row.try_get("total_generated")?,
            batch_started_at: row.try_get("batch_started_at")?,
            last_used_at: row.try_get("last_used_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Singleton row steering the submission pacing and the rotation cursor.
#[derive(Clone, Copy, Debug, FromRow)]
pub struct TokenSettings {
    pub last_used_token_index: i32,
    pub videos_per_batch: i32,
    pub batch_delay_seconds: i32,
}

#[derive(Clone, Debug)]
pub struct VideoJob {
    pub id: i64,
    pub user_id: i64,
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    pub status: JobStatus,
    pub video_url: Option<String>,
    pub operation_name: Option<String>,
    pub scene_id: Option<String>,
    pub token_used: Option<i64>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub reference_image_url: Option<String>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for VideoJob {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            prompt: row.try_get("prompt")?,
            aspect_ratio: parse_column(row, "aspect_ratio")?,
            status: parse_column(row, "status")?,
            video_url: row.try_get("video_url")?,
            operation_name: row.try_get("operation_name")?,
            scene_id: row.try_get("scene_id")?,
            token_used: row.try_get("token_used")?,
            retry_count: row.try_get("retry_count")?,
            error_message: row.try_get("error_message")?,
            reference_image_url: row.try_get("reference_image_url")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Partial update applied by `update_video_fields`. `None` leaves the column
/// untouched; `updated_at` is always set server-side.
#[derive(Clone, Debug, Default)]
pub struct VideoUpdate {
    pub status: Option<JobStatus>,
    pub video_url: Option<String>,
    pub operation_name: Option<String>,
    pub scene_id: Option<String>,
    pub token_used: Option<i64>,
    pub retry_count: Option<i32>,
    pub error_message: Option<String>,
    pub metadata: Option<String>,
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = UnknownValue>,
{
    row.try_get::<&str, _>(column)?
        .parse()
        .map_err(|_| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(UnknownValue),
        })
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(JobStatus::Pending => "pending")]
    #[test_case(JobStatus::Queued => "queued")]
    #[test_case(JobStatus::Completed => "completed")]
    #[test_case(JobStatus::Failed => "failed")]
    fn job_status_to_str(status: JobStatus) -> &'static str {
        status.into()
    }

    #[test_case("pending" => JobStatus::Pending)]
    #[test_case("failed" => JobStatus::Failed)]
    fn job_status_from_str(s: &str) -> JobStatus {
        s.parse().unwrap()
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("processing".parse::<JobStatus>().is_err());
    }
}
