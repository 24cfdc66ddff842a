use std::time::Duration;

use base64::Engine as _;
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::instrument;
use url::Url;

use crate::config::UpstreamConfig;
use crate::database::types::AspectRatio;

pub mod data;

use data::{
    aspect_ratio_tag, video_model_key, CheckStatusBody, ClientContext, GenerateImageBody,
    GenerateVideoBody, ImageInput, OperationHandle, OperationStatus, RawImageInput,
    SceneMetadata, StatusCheckEntry, StatusResponse, SubmitResponse, TextInput, UploadImageBody,
    UploadImageResponse, VideoGenerationRequest,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("upstream responded with status {status}: {body}")]
    InvalidResponse { status: StatusCode, body: String },

    #[error("upstream accepted the request but returned no operations")]
    MissingOperation,
}

impl Error {
    /// 5xx responses and network-level failures are transient; the caller
    /// retries them without failing the job.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Reqwest(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Error::InvalidResponse { status, .. } => status.is_server_error(),
            Error::UrlParse(_) | Error::MissingOperation => false,
        }
    }
}

/// Client for the video generation API.
///
/// One shared connection pool serves all submissions and status checks; the
/// credential is passed per call because it rotates between requests.
pub struct VideoApi {
    client: reqwest::Client,
    api_url: Url,
    project_id: String,
}

impl VideoApi {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.connection_pool_size)
            .pool_idle_timeout(config.keep_alive_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            project_id: config.project_id.clone(),
        })
    }

    /// Submits a text-to-video generation and returns the operation name.
    #[instrument(skip(self, api_key, prompt), level = "debug")]
    pub async fn submit_text_to_video(
        &self,
        api_key: &str,
        prompt: &str,
        aspect_ratio: AspectRatio,
        scene_id: &str,
        timeout: Duration,
    ) -> Result<String, Error> {
        let body = GenerateVideoBody {
            client_context: ClientContext::new(&self.project_id),
            requests: vec![VideoGenerationRequest {
                aspect_ratio: aspect_ratio_tag(aspect_ratio),
                seed: rand::thread_rng().gen(),
                text_input: Some(TextInput {
                    prompt: prompt.to_string(),
                }),
                image_input: None,
                video_model_key: video_model_key(aspect_ratio, false),
                metadata: SceneMetadata {
                    scene_id: scene_id.to_string(),
                },
            }],
        };

        let response: SubmitResponse = self
            .json_post(
                self.endpoint("video:batchAsyncGenerateVideoText")?,
                api_key,
                &body,
                timeout,
            )
            .await?;

        first_operation_name(response)
    }

    /// Submits an image-to-video generation using a previously uploaded
    /// reference image.
    #[instrument(skip(self, api_key, prompt), level = "debug")]
    pub async fn submit_image_to_video(
        &self,
        api_key: &str,
        media_id: &str,
        prompt: &str,
        aspect_ratio: AspectRatio,
        scene_id: &str,
        timeout: Duration,
    ) -> Result<String, Error> {
        let body = GenerateVideoBody {
            client_context: ClientContext::new(&self.project_id),
            requests: vec![VideoGenerationRequest {
                aspect_ratio: aspect_ratio_tag(aspect_ratio),
                seed: rand::thread_rng().gen(),
                text_input: Some(TextInput {
                    prompt: prompt.to_string(),
                }),
                image_input: Some(ImageInput {
                    media_id: media_id.to_string(),
                }),
                video_model_key: video_model_key(aspect_ratio, true),
                metadata: SceneMetadata {
                    scene_id: scene_id.to_string(),
                },
            }],
        };

        let response: SubmitResponse = self
            .json_post(
                self.endpoint("video:batchAsyncGenerateVideoReferenceImages")?,
                api_key,
                &body,
                timeout,
            )
            .await?;

        first_operation_name(response)
    }

    /// Polls one operation. Returns the raw per-operation status entry.
    #[instrument(skip(self, api_key), level = "debug")]
    pub async fn check_status(
        &self,
        api_key: &str,
        operation_name: &str,
        scene_id: &str,
        timeout: Duration,
    ) -> Result<OperationStatus, Error> {
        let body = CheckStatusBody {
            operations: vec![StatusCheckEntry {
                operation: OperationHandle {
                    name: operation_name.to_string(),
                },
                scene_id: scene_id.to_string(),
            }],
        };

        let response: StatusResponse = self
            .json_post(
                self.endpoint("video:batchCheckAsyncVideoGenerationStatus")?,
                api_key,
                &body,
                timeout,
            )
            .await?;

        response
            .operations
            .into_iter()
            .next()
            .ok_or(Error::MissingOperation)
    }

    /// Uploads a user image and returns the media id to reference in an
    /// image-to-video submission.
    #[instrument(skip_all, level = "debug")]
    pub async fn upload_image(
        &self,
        api_key: &str,
        image_bytes: &[u8],
        mime_type: &str,
        timeout: Duration,
    ) -> Result<String, Error> {
        let body = UploadImageBody {
            client_context: ClientContext::new(&self.project_id),
            image_input: RawImageInput {
                raw_image_bytes: base64::engine::general_purpose::STANDARD.encode(image_bytes),
                mime_type: mime_type.to_string(),
            },
        };

        let response: UploadImageResponse = self
            .json_post(self.endpoint("v1:uploadUserImage")?, api_key, &body, timeout)
            .await?;

        Ok(response.media_id)
    }

    /// Generates a still image from a prompt, returning base64 bytes.
    #[instrument(skip(self, api_key, prompt), level = "debug")]
    pub async fn generate_image(
        &self,
        api_key: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, Error> {
        let body = GenerateImageBody {
            client_context: ClientContext::new(&self.project_id),
            prompt: prompt.to_string(),
        };

        let response: data::GenerateImageResponse = self
            .json_post(self.endpoint("v1/whisk:generateImage")?, api_key, &body, timeout)
            .await?;

        response
            .images
            .into_iter()
            .next()
            .map(|image| image.encoded_image)
            .ok_or(Error::MissingOperation)
    }

    /// Endpoint paths contain `:`, which `Url::join` would read as a URL
    /// scheme, so they are appended textually.
    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        let base = self.api_url.as_str();

        let joined = if base.ends_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        };

        Ok(Url::parse(&joined)?)
    }

    async fn json_post<T, R>(
        &self,
        url: Url,
        api_key: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<R, Error>
    where
        T: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(body)
            .timeout(timeout)
            .send()
            .await?;

        let response = Self::validate_response(response).await?;

        Ok(response.json().await?)
    }

    async fn validate_response(response: reqwest::Response) -> Result<reqwest::Response, Error> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            tracing::error!("Upstream response failed with status {status} - {body}");
            return Err(Error::InvalidResponse { status, body });
        }

        Ok(response)
    }
}

fn first_operation_name(response: SubmitResponse) -> Result<String, Error> {
    response
        .operations
        .into_iter()
        .next()
        .map(|op| op.operation.name)
        .ok_or(Error::MissingOperation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = Error::InvalidResponse {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(err.is_transient());

        let err = Error::InvalidResponse {
            status: StatusCode::BAD_REQUEST,
            body: String::new(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn missing_operation_is_permanent() {
        assert!(!Error::MissingOperation.is_transient());
    }
}
