mod common;

use std::time::Duration;

use render_sequencer::config::{default, UpstreamConfig};
use render_sequencer::database::types::AspectRatio;
use render_sequencer::upstream::data::VideoStatus;
use render_sequencer::upstream::{Error, VideoApi};

use common::{spawn_mock_upstream, MockState};

const TIMEOUT: Duration = Duration::from_secs(5);

fn upstream_config(base_url: &str) -> UpstreamConfig {
    UpstreamConfig {
        api_url: url::Url::parse(base_url).unwrap(),
        project_id: "test-project".to_string(),
        fallback_api_key: None,
        connection_pool_size: default::connection_pool_size(),
        connect_timeout: default::connect_timeout(),
        keep_alive_timeout: default::keep_alive_timeout(),
    }
}

#[tokio::test]
async fn submit_returns_operation_name() -> anyhow::Result<()> {
    let mock = spawn_mock_upstream(MockState::default()).await;
    let api = VideoApi::new(&upstream_config(&mock.base_url()))?;

    let operation = api
        .submit_text_to_video(
            "test-key",
            "a sweeping shot of a mountain range",
            AspectRatio::Landscape,
            "bulk-1-1700000000000",
            TIMEOUT,
        )
        .await?;

    assert_eq!(operation, "operations/bulk-1-1700000000000");

    Ok(())
}

#[tokio::test]
async fn submit_surfaces_server_errors_as_transient() -> anyhow::Result<()> {
    let mock = spawn_mock_upstream(MockState {
        failing_submits: 10,
        ..MockState::default()
    })
    .await;
    let api = VideoApi::new(&upstream_config(&mock.base_url()))?;

    let result = api
        .submit_text_to_video(
            "test-key",
            "a sweeping shot of a mountain range",
            AspectRatio::Portrait,
            "bulk-2-1700000000000",
            TIMEOUT,
        )
        .await;

    let err = result.expect_err("expected a 503 to surface");
    assert!(matches!(err, Error::InvalidResponse { .. }));
    assert!(err.is_transient());

    Ok(())
}

#[tokio::test]
async fn status_check_goes_pending_then_complete() -> anyhow::Result<()> {
    let mock = spawn_mock_upstream(MockState {
        pending_polls: 1,
        artifact_url: "https://video.example.com/raw?token=abc&amp;scene=1".to_string(),
        ..MockState::default()
    })
    .await;
    let api = VideoApi::new(&upstream_config(&mock.base_url()))?;

    let first = api
        .check_status("test-key", "operations/op-1", "scene-1", TIMEOUT)
        .await?;
    assert_eq!(first.outcome(), VideoStatus::Pending);

    let second = api
        .check_status("test-key", "operations/op-1", "scene-1", TIMEOUT)
        .await?;

    // The decoded artifact URL comes out of the completed response.
    assert_eq!(
        second.outcome(),
        VideoStatus::Complete {
            video_url: "https://video.example.com/raw?token=abc&scene=1".to_string()
        }
    );

    Ok(())
}

#[tokio::test]
async fn image_upload_returns_media_id() -> anyhow::Result<()> {
    let mock = spawn_mock_upstream(MockState::default()).await;
    let api = VideoApi::new(&upstream_config(&mock.base_url()))?;

    let media_id = api
        .upload_image("test-key", b"raw image bytes", "image/png", TIMEOUT)
        .await?;

    assert_eq!(media_id, "media-123");

    Ok(())
}

#[tokio::test]
async fn generate_image_returns_encoded_payload() -> anyhow::Result<()> {
    let mock = spawn_mock_upstream(MockState::default()).await;
    let api = VideoApi::new(&upstream_config(&mock.base_url()))?;

    let encoded = api
        .generate_image("test-key", "a watercolor fox in the snow", TIMEOUT)
        .await?;

    assert_eq!(encoded, "aGVsbG8=");

    Ok(())
}
