// Read-only HTTP status endpoint over a running pipeline

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use vigil_eye::{DetectorId, PipelineHandle};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub running: bool,
    pub degraded: Vec<DetectorId>,
}

pub fn create_router(handle: Arc<PipelineHandle>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/alerts", get(alerts_handler))
        .route("/api/v1/detectors", get(detectors_handler))
        .route("/api/v1/stats", get(stats_handler))
        .route("/api/v1/frame.png", get(frame_handler))
        .with_state(handle)
}

/// Bind and serve until the task is aborted
pub async fn serve(addr: SocketAddr, handle: Arc<PipelineHandle>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Status endpoint listening");
    axum::serve(listener, create_router(handle)).await?;
    Ok(())
}

async fn health_handler(State(handle): State<Arc<PipelineHandle>>) -> impl IntoResponse {
    let running = handle.is_running();
    let degraded: Vec<DetectorId> = handle
        .health()
        .into_iter()
        .filter(|(_, h)| h.degraded)
        .map(|(id, _)| id)
        .collect();

    let (code, status) = match (running, degraded.is_empty()) {
        (false, _) => (StatusCode::SERVICE_UNAVAILABLE, "stopped"),
        (true, true) => (StatusCode::OK, "ok"),
        (true, false) => (StatusCode::OK, "degraded"),
    };
    (
        code,
        Json(HealthResponse {
            status,
            running,
            degraded,
        }),
    )
}

async fn alerts_handler(State(handle): State<Arc<PipelineHandle>>) -> impl IntoResponse {
    Json(handle.snapshot())
}

async fn detectors_handler(State(handle): State<Arc<PipelineHandle>>) -> impl IntoResponse {
    Json(handle.health())
}

async fn stats_handler(State(handle): State<Arc<PipelineHandle>>) -> impl IntoResponse {
    Json(handle.stats())
}

async fn frame_handler(State(handle): State<Arc<PipelineHandle>>) -> Response {
    let image = match handle.latest_frame().and_then(|f| f.to_rgb_image()) {
        Some(image) => image,
        None => {
            return error_response(StatusCode::NOT_FOUND, "No frame captured yet", "NO_FRAME");
        }
    };

    let mut png = Cursor::new(Vec::new());
    if let Err(e) = image.write_to(&mut png, image::ImageOutputFormat::Png) {
        error!("Failed to encode frame: {}", e);
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode frame",
            "ENCODE_FAILED",
        );
    }
    ([(header::CONTENT_TYPE, "image/png")], png.into_inner()).into_response()
}

fn error_response(code: StatusCode, error: &str, tag: &str) -> Response {
    (
        code,
        Json(ErrorResponse {
            error: error.to_string(),
            code: tag.to_string(),
        }),
    )
        .into_response()
}
