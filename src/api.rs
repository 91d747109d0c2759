#![forbid(unsafe_code)]

//! HTTP surface of the download service.
//!
//! Handlers only touch the job store and the runner; they never wait on an
//! extraction. Every failure is rendered as `{ "success": false, "message" }`
//! with a status code that matches the error class.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactError, ArtifactServer, DEFAULT_DISPLAY_TITLE, download_reference};
use crate::jobs::{DEFAULT_QUALITY, Job, JobState, JobStore, JobStoreError, MediaKind};
use crate::runner::{CancelError, JobRunner};
use crate::security::is_valid_target_id;

const NOT_FOUND_MESSAGE: &str = "Download not found";

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub runner: JobRunner,
    pub artifacts: Arc<ArtifactServer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/download", post(enqueue_download))
        .route("/api/download/progress/{job_id}", get(download_progress))
        .route("/api/download/cancel/{job_id}", post(cancel_download))
        .route("/download/{filename}", get(serve_artifact))
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    /// Logs the real cause and hides it from the client.
    fn internal(cause: impl std::fmt::Display) -> Self {
        error!("request failed: {cause}");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Internal server error".into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<ArtifactError> for ApiError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::InvalidName => Self::bad_request("Invalid filename"),
            ArtifactError::AccessDenied => Self::forbidden("Access denied"),
            ArtifactError::NotFound => Self::not_found("File not found"),
            other => Self::internal(other),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Body of `POST /api/download`. Older clients send `video_id` and `type`.
#[derive(Debug, Default, Deserialize)]
pub struct EnqueueRequest {
    #[serde(default, alias = "video_id")]
    pub target_id: Option<String>,
    #[serde(default, alias = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub quality: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub success: bool,
    pub job_id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub success: bool,
    #[serde(flatten)]
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_reference: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ArtifactQuery {
    pub title: Option<String>,
}

async fn enqueue_download(
    State(state): State<AppState>,
    payload: Result<Json<EnqueueRequest>, JsonRejection>,
) -> ApiResult<Json<EnqueueResponse>> {
    let Json(request) = payload.map_err(|rejection| {
        warn!("rejecting malformed download request: {rejection}");
        ApiError::bad_request(format!("Invalid request body: {}", rejection.body_text()))
    })?;

    let target_id = request
        .target_id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("Video ID is required"))?;
    if !is_valid_target_id(&target_id) {
        return Err(ApiError::bad_request("Invalid video ID"));
    }
    let kind = match request.kind.as_deref() {
        None => MediaKind::Video,
        Some(raw) => MediaKind::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("Unsupported download type: {raw}")))?,
    };
    let quality = quality_string(request.quality.as_ref())?;

    let job = Job::new(Uuid::new_v4().to_string(), target_id, kind, quality);
    state.jobs.create(job.clone()).map_err(ApiError::internal)?;
    state.runner.schedule(&job);
    info!(
        job_id = %job.job_id,
        target_id = %job.target_id,
        kind = kind.as_str(),
        quality = %job.quality,
        "download queued"
    );

    Ok(Json(EnqueueResponse {
        success: true,
        job_id: job.job_id,
        message: "Download started".into(),
    }))
}

/// Accepts `"720"`, `720` or nothing; anything else is a client error.
fn quality_string(value: Option<&Value>) -> ApiResult<String> {
    match value {
        None | Some(Value::Null) => Ok(DEFAULT_QUALITY.to_string()),
        Some(Value::String(raw)) if raw.trim().is_empty() => Ok(DEFAULT_QUALITY.to_string()),
        Some(Value::String(raw)) => Ok(raw.trim().to_string()),
        Some(Value::Number(number)) => Ok(number.to_string()),
        Some(_) => Err(ApiError::bad_request("Quality must be a string or a number")),
    }
}

async fn download_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<ProgressResponse>> {
    let job = state.jobs.get(&job_id).map_err(|err| match err {
        JobStoreError::NotFound(_) => ApiError::not_found(NOT_FOUND_MESSAGE),
        other => ApiError::internal(other),
    })?;

    let download_reference = match (&job.state, &job.artifact_name) {
        (JobState::Completed, Some(name)) => Some(download_reference(
            name,
            job.title.as_deref().unwrap_or(DEFAULT_DISPLAY_TITLE),
        )),
        _ => None,
    };
    Ok(Json(ProgressResponse {
        success: true,
        job,
        download_reference,
    }))
}

async fn cancel_download(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    match state.runner.cancel(&job_id) {
        Ok(_) => Ok(Json(CancelResponse {
            success: true,
            message: "Download cancelled".into(),
        })),
        Err(CancelError::NotFound) => Err(ApiError::not_found(NOT_FOUND_MESSAGE)),
        Err(err @ CancelError::Rejected(_)) => Err(ApiError::conflict(err.to_string())),
    }
}

/// `HEAD` shares this route but must not use up the one-time download.
async fn serve_artifact(
    State(state): State<AppState>,
    method: Method,
    Path(filename): Path<String>,
    Query(query): Query<ArtifactQuery>,
) -> ApiResult<Response> {
    let title = query.title.as_deref();
    if method == Method::HEAD {
        return Ok(state.artifacts.describe(&filename, title).await?);
    }
    Ok(state.artifacts.serve(&filename, title).await?)
}

async fn fallback(uri: Uri) -> ApiError {
    ApiError::not_found(format!("endpoint not found: {}", uri.path()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{
        ExtractionError, Extractor, FetchOutcome, FetchRequest, ProgressSink,
    };
    use crate::jobs::MemoryJobStore;
    use axum::body::to_bytes;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    /// Never finishes on its own; only a cancellation ends the fetch.
    struct StalledExtractor;

    impl Extractor for StalledExtractor {
        fn fetch(
            &self,
            _request: &FetchRequest,
            _progress: &dyn ProgressSink,
            cancel: &CancellationToken,
        ) -> Result<FetchOutcome, ExtractionError> {
            while !cancel.is_cancelled() {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(ExtractionError::Cancelled)
        }
    }

    struct TestContext {
        _temp: tempfile::TempDir,
        store: Arc<MemoryJobStore>,
        state: AppState,
    }

    impl TestContext {
        fn new() -> Self {
            let temp = tempdir().unwrap();
            let store = Arc::new(MemoryJobStore::new());
            let runner = JobRunner::new(
                store.clone(),
                Arc::new(StalledExtractor),
                temp.path().to_path_buf(),
                1,
            );
            let state = AppState {
                jobs: store.clone(),
                runner,
                artifacts: Arc::new(ArtifactServer::new(temp.path())),
            };
            Self {
                _temp: temp,
                store,
                state,
            }
        }
    }

    impl Drop for TestContext {
        fn drop(&mut self) {
            self.state.runner.shutdown();
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(value: Value) -> Result<Json<EnqueueRequest>, JsonRejection> {
        Ok(Json(serde_json::from_value(value).unwrap()))
    }

    #[tokio::test]
    async fn enqueue_requires_target_id() {
        let ctx = TestContext::new();
        let err = enqueue_download(State(ctx.state.clone()), request(json!({"kind": "audio"})))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let body = body_json(err.into_response()).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Video ID is required");
        assert!(ctx.store.is_empty());
    }

    #[tokio::test]
    async fn enqueue_rejects_option_like_ids_and_unknown_kinds() {
        let ctx = TestContext::new();
        let err = enqueue_download(
            State(ctx.state.clone()),
            request(json!({"target_id": "--exec=rm"})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = enqueue_download(
            State(ctx.state.clone()),
            request(json!({"target_id": "abc123", "kind": "podcast"})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(ctx.store.is_empty());
    }

    #[tokio::test]
    async fn enqueue_accepts_legacy_field_names() {
        let ctx = TestContext::new();
        let Json(response) = enqueue_download(
            State(ctx.state.clone()),
            request(json!({"video_id": "abc123", "type": "audio", "quality": 320})),
        )
        .await
        .unwrap();
        assert!(response.success);

        let job = ctx.store.get(&response.job_id).unwrap();
        assert_eq!(job.target_id, "abc123");
        assert_eq!(job.kind, MediaKind::Audio);
        assert_eq!(job.quality, "320");
    }

    #[tokio::test]
    async fn enqueue_defaults_to_best_video() {
        let ctx = TestContext::new();
        let Json(response) = enqueue_download(
            State(ctx.state.clone()),
            request(json!({"target_id": "abc123"})),
        )
        .await
        .unwrap();
        let job = ctx.store.get(&response.job_id).unwrap();
        assert_eq!(job.kind, MediaKind::Video);
        assert_eq!(job.quality, DEFAULT_QUALITY);
    }

    #[tokio::test]
    async fn progress_of_unknown_job_is_not_found() {
        let ctx = TestContext::new();
        let err = download_progress(State(ctx.state.clone()), Path("missing".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let body = body_json(err.into_response()).await;
        assert_eq!(body["message"], NOT_FOUND_MESSAGE);
    }

    #[tokio::test]
    async fn completed_progress_carries_a_download_reference() {
        let ctx = TestContext::new();
        let mut job = Job::new("done".into(), "abc123".into(), MediaKind::Audio, "192".into());
        job.mark_starting();
        job.complete("f00d.mp3".into(), "Song & Dance".into());
        ctx.store.create(job).unwrap();

        let Json(progress) = download_progress(State(ctx.state.clone()), Path("done".into()))
            .await
            .unwrap();
        let body = serde_json::to_value(&progress).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["state"], "completed");
        assert_eq!(body["progress_percent"], 100.0);
        assert_eq!(body["artifact_name"], "f00d.mp3");
        assert_eq!(
            body["download_reference"],
            "/download/f00d.mp3?title=Song%20%26%20Dance"
        );
    }

    #[tokio::test]
    async fn cancel_reports_each_outcome() {
        let ctx = TestContext::new();
        let err = cancel_download(State(ctx.state.clone()), Path("ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let Json(queued) = enqueue_download(
            State(ctx.state.clone()),
            request(json!({"target_id": "abc123"})),
        )
        .await
        .unwrap();
        let Json(cancelled) = cancel_download(State(ctx.state.clone()), Path(queued.job_id.clone()))
            .await
            .unwrap();
        assert!(cancelled.success);
        assert_eq!(ctx.store.get(&queued.job_id).unwrap().state, JobState::Cancelled);

        let err = cancel_download(State(ctx.state.clone()), Path(queued.job_id))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        let body = body_json(err.into_response()).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn artifact_errors_map_to_status_codes() {
        let ctx = TestContext::new();
        for (name, status) in [
            ("..", StatusCode::BAD_REQUEST),
            ("../../etc/passwd", StatusCode::FORBIDDEN),
            ("missing.mp4", StatusCode::NOT_FOUND),
        ] {
            let err = serve_artifact(
                State(ctx.state.clone()),
                Method::GET,
                Path(name.into()),
                Query(ArtifactQuery::default()),
            )
            .await
            .unwrap_err();
            assert_eq!(err.status(), status, "{name}");
        }
    }

    #[tokio::test]
    async fn head_leaves_the_artifact_for_the_real_download() {
        let ctx = TestContext::new();
        let path = ctx.state.artifacts.root().join("f00d.mp4");
        std::fs::write(&path, b"video").unwrap();

        let response = serve_artifact(
            State(ctx.state.clone()),
            Method::HEAD,
            Path("f00d.mp4".into()),
            Query(ArtifactQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        drop(response);
        assert!(path.exists());

        let response = serve_artifact(
            State(ctx.state.clone()),
            Method::GET,
            Path("f00d.mp4".into()),
            Query(ArtifactQuery::default()),
        )
        .await
        .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"video");
        assert!(!path.exists());
    }
}
