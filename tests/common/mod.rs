// We include this module in multiple integration test crates - so some code
// may not be used in some cases
#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Json;
use axum::Router;
use serde_json::{json, Value};

/// Scripted behavior for the mock upstream + media host.
#[derive(Default)]
pub struct MockState {
    /// Number of status checks answered so far.
    pub status_calls: AtomicUsize,
    /// Status checks that report in-progress before completing.
    pub pending_polls: usize,
    /// Number of submissions received so far.
    pub submit_calls: AtomicUsize,
    /// Submissions that fail with a 503 before one succeeds.
    pub failing_submits: usize,
    /// Number of media uploads received so far.
    pub upload_calls: AtomicUsize,
    /// Media uploads that fail with a 503 before one succeeds.
    pub failing_uploads: usize,
    /// Artifact URL embedded in the completed status response. The literal
    /// `{base}` is replaced with the mock server's own base URL.
    pub artifact_url: String,
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockUpstream {
    pub fn base_url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn url(&self, path: &str) -> url::Url {
        url::Url::parse(&format!("http://{}{path}", self.addr)).unwrap()
    }
}

/// Serves a scripted stand-in for the video generation API and the media
/// host on a random local port.
pub async fn spawn_mock_upstream(state: MockState) -> MockUpstream {
    let state = Arc::new(state);

    // The upstream paths contain `:`, which the router would read as a
    // capture, so everything is dispatched from the fallback by hand.
    let app = Router::new()
        .fallback(dispatch)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::LOCALHOST,
        0,
    )))
    .await
    .unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockUpstream { addr, state }
}

async fn dispatch(
    State(state): State<Arc<MockState>>,
    uri: Uri,
    body: Bytes,
) -> axum::response::Response {
    let path = uri.path().to_string();

    if path.contains("batchAsyncGenerateVideoText")
        || path.contains("batchAsyncGenerateVideoReferenceImages")
    {
        return handle_submit(&state, &body).await.into_response();
    }

    if path.contains("batchCheckAsyncVideoGenerationStatus") {
        return handle_status(&state, &body).await.into_response();
    }

    if path.contains("uploadUserImage") {
        return Json(json!({ "mediaId": "media-123" })).into_response();
    }

    if path.contains("generateImage") {
        return Json(json!({ "images": [{ "encodedImage": "aGVsbG8=" }] })).into_response();
    }

    if path == "/artifact" {
        return (StatusCode::OK, Bytes::from_static(b"fake video bytes")).into_response();
    }

    if path.starts_with("/upload/") {
        let calls = state.upload_calls.fetch_add(1, Ordering::SeqCst);
        if calls < state.failing_uploads {
            return (StatusCode::SERVICE_UNAVAILABLE, "upload backend down").into_response();
        }
        return Json(json!({
            "secure_url": format!("https://media.example.com/hosted/{}", calls + 1)
        }))
        .into_response();
    }

    (StatusCode::NOT_FOUND, format!("no mock for {path}")).into_response()
}

async fn handle_submit(state: &MockState, body: &Bytes) -> axum::response::Response {
    let calls = state.submit_calls.fetch_add(1, Ordering::SeqCst);
    if calls < state.failing_submits {
        return (StatusCode::SERVICE_UNAVAILABLE, "try again").into_response();
    }

    let request: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let scene_id = request["requests"][0]["metadata"]["sceneId"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();

    Json(json!({
        "operations": [{
            "operation": { "name": format!("operations/{scene_id}") },
            "sceneId": scene_id,
        }]
    }))
    .into_response()
}

async fn handle_status(state: &MockState, body: &Bytes) -> axum::response::Response {
    let calls = state.status_calls.fetch_add(1, Ordering::SeqCst);

    let request: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let operation_name = request["operations"][0]["operation"]["name"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();
    let scene_id = request["operations"][0]["sceneId"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();

    if calls < state.pending_polls {
        return Json(json!({
            "operations": [{
                "operation": { "name": operation_name },
                "sceneId": scene_id,
                "status": "MEDIA_GENERATION_STATUS_ACTIVE",
            }]
        }))
        .into_response();
    }

    Json(json!({
        "operations": [{
            "operation": { "name": operation_name },
            "sceneId": scene_id,
            "status": "MEDIA_GENERATION_STATUS_COMPLETE",
            "metadata": { "video": { "fifeUrl": state.artifact_url } },
        }]
    }))
    .into_response()
}
