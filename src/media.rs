use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{instrument, warn};
use url::Url;

use crate::config::MediaConfig;
use crate::utils::{apply_jitter, backoff_delay};

const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(10);
const RETRY_ATTEMPTS: u32 = 5;
const RETRY_JITTER: f64 = 0.3;

/// Network failure signatures that warrant a retry of a stage.
const RETRYABLE_MESSAGES: &[&str] = &[
    "fetch failed",
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "EPIPE",
    "socket disconnected",
    "connection reset",
    "tls connection",
    "handshake",
];

#[derive(Debug, Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("media host responded with status {status}: {body}")]
    UploadFailed { status: StatusCode, body: String },

    #[error("artifact fetch responded with status {status}")]
    FetchFailed { status: StatusCode },
}

impl Error {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Reqwest(err) => {
                if err.is_timeout() || err.is_connect() {
                    return true;
                }
                let message = err.to_string();
                RETRYABLE_MESSAGES
                    .iter()
                    .any(|m| message.to_lowercase().contains(&m.to_lowercase()))
            }
            Error::UploadFailed { status, .. } | Error::FetchFailed { status } => {
                status.is_server_error()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: String,
}

/// Re-hosts upstream artifacts on the media store.
///
/// Two stages, each independently retried: fetch the bytes from the
/// (expiring) upstream URL, then post them to the unsigned upload endpoint.
/// The stable `secure_url` from the response becomes the hosted URL.
pub struct MediaUploader {
    client: reqwest::Client,
    video_upload_url: Url,
    image_upload_url: Url,
    upload_preset: String,
}

impl MediaUploader {
    pub fn new(config: &MediaConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            video_upload_url: config.video_upload_url.clone(),
            image_upload_url: config.image_upload_url.clone(),
            upload_preset: config.upload_preset.clone(),
        })
    }

    /// Fetches the artifact at `upstream_url` and re-hosts it, returning the
    /// stable hosted URL.
    #[instrument(skip(self), level = "debug")]
    pub async fn upload_video(&self, upstream_url: &str) -> Result<String, Error> {
        let bytes = with_network_retry(|| self.fetch_bytes(upstream_url)).await?;

        with_network_retry(|| {
            self.post_multipart(
                self.video_upload_url.clone(),
                bytes.clone(),
                "video.mp4",
                "video/mp4",
            )
        })
        .await
    }

    /// Re-hosts raw image bytes (e.g. a generated still), returning the
    /// hosted URL.
    #[instrument(skip_all, level = "debug")]
    pub async fn upload_image(&self, bytes: Bytes, mime_type: &str) -> Result<String, Error> {
        let file_name = match mime_type {
            "image/png" => "image.png",
            _ => "image.jpg",
        };

        with_network_retry(|| {
            self.post_multipart(
                self.image_upload_url.clone(),
                bytes.clone(),
                file_name,
                mime_type,
            )
        })
        .await
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Bytes, Error> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(Error::FetchFailed {
                status: response.status(),
            });
        }

        Ok(response.bytes().await?)
    }

    async fn post_multipart(
        &self,
        endpoint: Url,
        bytes: Bytes,
        file_name: &str,
        mime_type: &str,
    ) -> Result<String, Error> {
        let part = Part::stream(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime_type)?;

        let form = Form::new()
            .part("file", part)
            .text("upload_preset", self.upload_preset.clone());

        let response = self.client.post(endpoint).multipart(form).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UploadFailed { status, body });
        }

        let upload: UploadResponse = response.json().await?;

        Ok(upload.secure_url)
    }
}

/// Retries one upload stage on the network-error whitelist. Non-retryable
/// errors propagate immediately.
async fn with_network_retry<T, F, Fut>(op: F) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < RETRY_ATTEMPTS => {
                let delay = apply_jitter(backoff_delay(RETRY_BASE, RETRY_CAP, attempt), RETRY_JITTER);
                warn!(?err, attempt = attempt + 1, ?delay, "media stage failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let err = Error::UploadFailed {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        assert!(err.is_retryable());

        let err = Error::FetchFailed {
            status: StatusCode::BAD_GATEWAY,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let err = Error::UploadFailed {
            status: StatusCode::UNAUTHORIZED,
            body: String::new(),
        };
        assert!(!err.is_retryable());

        let err = Error::FetchFailed {
            status: StatusCode::NOT_FOUND,
        };
        assert!(!err.is_retryable());
    }
}
