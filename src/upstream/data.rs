use serde::{Deserialize, Serialize};

use crate::database::types::AspectRatio;

/// Aspect ratio tag understood by the video generation API.
pub fn aspect_ratio_tag(ratio: AspectRatio) -> &'static str {
    match ratio {
        AspectRatio::Landscape => "VIDEO_ASPECT_RATIO_LANDSCAPE",
        AspectRatio::Portrait => "VIDEO_ASPECT_RATIO_PORTRAIT",
    }
}

/// Model key for a submission. The upstream exposes distinct fast models per
/// aspect ratio and per text/image input mode.
pub fn video_model_key(ratio: AspectRatio, with_reference_image: bool) -> &'static str {
    match (ratio, with_reference_image) {
        (AspectRatio::Landscape, false) => "veo_3_1_fast_ultra_t2v",
        (AspectRatio::Portrait, false) => "veo_3_1_fast_ultra_portrait_t2v",
        (AspectRatio::Landscape, true) => "veo_3_1_fast_ultra_i2v",
        (AspectRatio::Portrait, true) => "veo_3_1_fast_ultra_portrait_i2v",
    }
}

/// Correlation id for one submission attempt. A re-submission mints a new
/// one so stale status responses cannot be confused with the new attempt.
pub fn scene_id_for_job(job_id: i64) -> String {
    format!("bulk-{job_id}-{}", chrono::Utc::now().timestamp_millis())
}

/// Upstream statuses that mean the artifact is ready.
const TERMINAL_SUCCESS_STATUSES: &[&str] = &[
    "COMPLETED",
    "MEDIA_GENERATION_STATUS_COMPLETE",
    "MEDIA_GENERATION_STATUS_SUCCESSFUL",
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContext {
    pub project_id: String,
    pub tool: &'static str,
}

impl ClientContext {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            tool: "PINHOLE",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextInput {
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInput {
    pub media_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneMetadata {
    pub scene_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGenerationRequest {
    pub aspect_ratio: &'static str,
    pub seed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_input: Option<TextInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_input: Option<ImageInput>,
    pub video_model_key: &'static str,
    pub metadata: SceneMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateVideoBody {
    pub client_context: ClientContext,
    pub requests: Vec<VideoGenerationRequest>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationHandle {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCheckEntry {
    pub operation: OperationHandle,
    pub scene_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckStatusBody {
    pub operations: Vec<StatusCheckEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadImageBody {
    pub client_context: ClientContext,
    pub image_input: RawImageInput,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawImageInput {
    pub raw_image_bytes: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateImageBody {
    pub client_context: ClientContext,
    pub prompt: String,
}

// ---------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    #[serde(default)]
    pub operations: Vec<SubmittedOperation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedOperation {
    pub operation: NamedOperation,
    #[serde(default)]
    pub scene_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedOperation {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(default)]
    pub operations: Vec<OperationStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    #[serde(default)]
    pub operation: Option<NamedOperation>,
    #[serde(default)]
    pub scene_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<OperationError>,
    #[serde(default)]
    pub metadata: Option<OperationMetadata>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetadata {
    #[serde(default)]
    pub video: Option<VideoMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    #[serde(default)]
    pub fife_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadImageResponse {
    pub media_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateImageResponse {
    #[serde(default)]
    pub images: Vec<GeneratedImage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub encoded_image: String,
}

/// What one poll of an operation means for the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoStatus {
    /// Artifact ready; carries the decoded upstream URL.
    Complete { video_url: String },
    /// Upstream reported a permanent error.
    Error { message: String },
    /// Still generating.
    Pending,
}

impl OperationStatus {
    /// Ordered search for the artifact URL, then HTML entity decoding.
    pub fn extract_video_url(&self) -> Option<String> {
        let raw = self
            .metadata
            .as_ref()
            .and_then(|m| m.video.as_ref())
            .and_then(|v| v.fife_url.as_deref())
            .or(self.video_url.as_deref())
            .or(self.file_url.as_deref())
            .or(self.download_url.as_deref())?;

        Some(decode_html_entities(raw))
    }

    pub fn outcome(&self) -> VideoStatus {
        if let Some(error) = &self.error {
            let message = error
                .message
                .clone()
                .unwrap_or_else(|| format!("Upstream error code {}", error.code.unwrap_or(0)));
            return VideoStatus::Error { message };
        }

        let is_complete = self
            .status
            .as_deref()
            .is_some_and(|s| TERMINAL_SUCCESS_STATUSES.contains(&s));

        if is_complete {
            if let Some(video_url) = self.extract_video_url() {
                return VideoStatus::Complete { video_url };
            }
        }

        VideoStatus::Pending
    }
}

/// Decodes the five named/numeric entities the upstream emits in URLs.
///
/// `&amp;` is decoded last so double-encoded sequences do not re-decode.
pub fn decode_html_entities(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("https://a.test/v?x=1&amp;y=2" => "https://a.test/v?x=1&y=2")]
    #[test_case("&lt;tag&gt;" => "<tag>")]
    #[test_case("say &quot;hi&quot; &#39;now&#39;" => "say \"hi\" 'now'")]
    #[test_case("plain" => "plain")]
    #[test_case("&amp;lt;" => "&lt;"; "no double decoding")]
    fn entity_decoding(input: &str) -> String {
        decode_html_entities(input)
    }

    fn status_with(
        fife: Option<&str>,
        video: Option<&str>,
        file: Option<&str>,
        download: Option<&str>,
    ) -> OperationStatus {
        OperationStatus {
            metadata: fife.map(|url| OperationMetadata {
                video: Some(VideoMetadata {
                    fife_url: Some(url.to_string()),
                }),
            }),
            video_url: video.map(str::to_string),
            file_url: file.map(str::to_string),
            download_url: download.map(str::to_string),
            ..OperationStatus::default()
        }
    }

    #[test]
    fn url_extraction_prefers_fife_url() {
        let status = status_with(Some("https://f"), Some("https://v"), None, None);
        assert_eq!(status.extract_video_url().unwrap(), "https://f");
    }

    #[test]
    fn url_extraction_falls_back_in_order() {
        let status = status_with(None, None, Some("https://file"), Some("https://dl"));
        assert_eq!(status.extract_video_url().unwrap(), "https://file");

        let status = status_with(None, None, None, Some("https://dl"));
        assert_eq!(status.extract_video_url().unwrap(), "https://dl");

        let status = status_with(None, None, None, None);
        assert_eq!(status.extract_video_url(), None);
    }

    #[test]
    fn completed_status_with_url_is_complete() {
        let mut status = status_with(None, Some("https://v?a=1&amp;b=2"), None, None);
        status.status = Some("MEDIA_GENERATION_STATUS_COMPLETE".to_string());

        assert_eq!(
            status.outcome(),
            VideoStatus::Complete {
                video_url: "https://v?a=1&b=2".to_string()
            }
        );
    }

    #[test]
    fn completed_status_without_url_stays_pending() {
        let mut status = status_with(None, None, None, None);
        status.status = Some("COMPLETED".to_string());

        assert_eq!(status.outcome(), VideoStatus::Pending);
    }

    #[test]
    fn error_field_wins_over_status() {
        let mut status = status_with(None, Some("https://v"), None, None);
        status.status = Some("MEDIA_GENERATION_STATUS_SUCCESSFUL".to_string());
        status.error = Some(OperationError {
            code: Some(9),
            message: Some("quota exhausted".to_string()),
        });

        assert_eq!(
            status.outcome(),
            VideoStatus::Error {
                message: "quota exhausted".to_string()
            }
        );
    }

    #[test]
    fn in_progress_status_is_pending() {
        let mut status = status_with(None, None, None, None);
        status.status = Some("MEDIA_GENERATION_STATUS_ACTIVE".to_string());

        assert_eq!(status.outcome(), VideoStatus::Pending);
    }

    #[test]
    fn scene_ids_embed_the_job_id() {
        let scene_id = scene_id_for_job(42);
        assert!(scene_id.starts_with("bulk-42-"));
    }

    #[test]
    fn model_keys_vary_by_ratio_and_mode() {
        assert_ne!(
            video_model_key(AspectRatio::Landscape, false),
            video_model_key(AspectRatio::Portrait, false)
        );
        assert_ne!(
            video_model_key(AspectRatio::Landscape, false),
            video_model_key(AspectRatio::Landscape, true)
        );
    }
}
