use std::sync::Arc;

use tracing::{info, warn};

use crate::app::App;
use crate::database::methods::DbMethods as _;
use crate::polling::PollJob;

/// One-shot startup scan re-attaching the polling coordinator to jobs the
/// previous process left in flight.
///
/// Queued rows that carry an operation name are resumable: we look up their
/// token (or fall back to the environment key) and enqueue them for polling.
/// Rows without a usable credential are failed immediately rather than left
/// to dangle until the stale sweep.
pub async fn recover_jobs(app: Arc<App>) -> anyhow::Result<()> {
    let resumable = app
        .database
        .with_retry(|| async { app.database.pool.get_resumable_videos().await })
        .await?;

    if resumable.is_empty() {
        info!("no in-flight jobs to recover");
        return Ok(());
    }

    info!(count = resumable.len(), "recovering in-flight jobs");

    let fallback_key = app
        .config
        .upstream
        .fallback_api_key
        .as_ref()
        .map(|key| key.expose().to_string());

    for video in resumable {
        let (Some(operation_name), Some(scene_id)) =
            (video.operation_name.clone(), video.scene_id.clone())
        else {
            continue;
        };

        let token = match video.token_used {
            Some(token_id) => app
                .database
                .with_retry(|| async { app.database.pool.get_token(token_id).await })
                .await?
                .filter(|t| t.is_active),
            None => None,
        };

        let (api_key, token_id) = match (token, &fallback_key) {
            (Some(token), _) => (token.token.clone(), Some(token.id)),
            (None, Some(key)) => (key.clone(), None),
            (None, None) => {
                warn!(job_id = video.id, "no credential to resume job, failing it");
                app.database
                    .with_retry(|| async {
                        app.database
                            .pool
                            .mark_video_failed(
                                video.id,
                                "Interrupted by restart and no credential available to resume",
                            )
                            .await
                    })
                    .await?;
                continue;
            }
        };

        app.polling.enqueue_status_check(PollJob {
            job_id: video.id,
            prompt: video.prompt.clone(),
            aspect_ratio: video.aspect_ratio,
            operation_name,
            scene_id,
            api_key,
            token_id,
            reference_media_id: None,
        });
    }

    Ok(())
}
