mod common;

use std::sync::atomic::Ordering;

use render_sequencer::config::MediaConfig;
use render_sequencer::media::MediaUploader;

use common::{spawn_mock_upstream, MockState};

fn media_config(mock: &common::MockUpstream) -> MediaConfig {
    MediaConfig {
        video_upload_url: mock.url("/upload/video"),
        image_upload_url: mock.url("/upload/image"),
        upload_preset: "unsigned_test".to_string(),
    }
}

#[tokio::test]
async fn fetches_and_rehosts_artifact() -> anyhow::Result<()> {
    let mock = spawn_mock_upstream(MockState::default()).await;
    let uploader = MediaUploader::new(&media_config(&mock))?;

    let artifact_url = mock.url("/artifact").to_string();
    let hosted = uploader.upload_video(&artifact_url).await?;

    assert_eq!(hosted, "https://media.example.com/hosted/1");
    assert_eq!(mock.state.upload_calls.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn upload_retries_transient_failures() -> anyhow::Result<()> {
    let mock = spawn_mock_upstream(MockState {
        failing_uploads: 2,
        ..MockState::default()
    })
    .await;
    let uploader = MediaUploader::new(&media_config(&mock))?;

    let artifact_url = mock.url("/artifact").to_string();
    let hosted = uploader.upload_video(&artifact_url).await?;

    // Two 503s, then success on the third attempt.
    assert_eq!(hosted, "https://media.example.com/hosted/3");
    assert_eq!(mock.state.upload_calls.load(Ordering::SeqCst), 3);

    Ok(())
}

#[tokio::test]
async fn missing_artifact_is_not_retried() -> anyhow::Result<()> {
    let mock = spawn_mock_upstream(MockState::default()).await;
    let uploader = MediaUploader::new(&media_config(&mock))?;

    let missing_url = mock.url("/missing-artifact").to_string();
    let result = uploader.upload_video(&missing_url).await;

    assert!(result.is_err());
    // The upload stage is never reached.
    assert_eq!(mock.state.upload_calls.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test]
async fn image_bytes_are_rehosted() -> anyhow::Result<()> {
    let mock = spawn_mock_upstream(MockState::default()).await;
    let uploader = MediaUploader::new(&media_config(&mock))?;

    let hosted = uploader
        .upload_image(bytes::Bytes::from_static(b"png bytes"), "image/png")
        .await?;

    assert_eq!(hosted, "https://media.example.com/hosted/1");

    Ok(())
}
