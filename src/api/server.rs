use std::path::PathBuf;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::pipeline::{PipelineError, PipelineHandle, PipelineStatus, SourceDescriptor};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: PipelineHandle,
    pub camera_device: String,
}

impl AppState {
    pub fn new(pipeline: PipelineHandle, camera_device: String) -> Self {
        Self {
            pipeline,
            camera_device,
        }
    }
}

#[derive(Deserialize)]
struct FileRequest {
    path: PathBuf,
}

#[derive(Deserialize)]
struct CameraQuery {
    device: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/session/file", post(file_handler))
        .route("/api/session/camera", post(camera_handler))
        .route("/api/session/stop", post(stop_handler))
        .route("/api/session/reset", post(reset_handler))
        .with_state(state)
}

pub async fn start_server(state: AppState, port: u16) -> Result<(), std::io::Error> {
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("starting HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn status_handler(State(state): State<AppState>) -> Json<PipelineStatus> {
    Json(state.pipeline.status())
}

async fn file_handler(
    State(state): State<AppState>,
    Json(request): Json<FileRequest>,
) -> Response {
    let result = state
        .pipeline
        .start(SourceDescriptor::File(request.path))
        .await;
    respond(&state, result)
}

async fn camera_handler(
    State(state): State<AppState>,
    Query(query): Query<CameraQuery>,
) -> Response {
    let device = query
        .device
        .unwrap_or_else(|| state.camera_device.clone());
    let result = state
        .pipeline
        .start(SourceDescriptor::Camera { device })
        .await;
    respond(&state, result)
}

async fn stop_handler(State(state): State<AppState>) -> Response {
    let result = state.pipeline.stop().await;
    respond(&state, result)
}

async fn reset_handler(State(state): State<AppState>) -> Response {
    let result = state.pipeline.reset().await;
    respond(&state, result)
}

fn respond(state: &AppState, result: Result<(), PipelineError>) -> Response {
    match result {
        Ok(()) => Json(state.pipeline.status()).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "session request failed");
            (
                status_code(&e),
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

fn status_code(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::Faulted => StatusCode::CONFLICT,
        PipelineError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::Spawn { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
