use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, FixedOffset};
use serde::Serialize;

use crate::detection::{DetectionError, DetectionManager, StartOutcome, StopOutcome};
use crate::storage::{AlertStore, CameraStore, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub manager: DetectionManager,
    pub cameras: Arc<dyn CameraStore>,
    pub alerts: Arc<dyn AlertStore>,
}

impl AppState {
    pub fn new(
        manager: DetectionManager,
        cameras: Arc<dyn CameraStore>,
        alerts: Arc<dyn AlertStore>,
    ) -> Self {
        Self {
            manager,
            cameras,
            alerts,
        }
    }
}

#[derive(Serialize)]
struct ControlResponse {
    camera_id: String,
    message: &'static str,
    active: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    camera_id: String,
    camera_name: String,
    camera_location: String,
    active: bool,
    source: Option<String>,
    started_at: Option<DateTime<FixedOffset>>,
}

#[derive(Serialize)]
struct ErrorResponse {
    camera_id: Option<String>,
    error: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/cameras", get(cameras_handler))
        .route("/api/alerts", get(alerts_handler))
        .route("/api/detection/{id}/start", post(start_handler))
        .route("/api/detection/{id}/stop", post(stop_handler))
        .route("/api/detection/{id}/status", get(status_handler))
        .with_state(state)
}

pub async fn start_server(state: AppState, port: u16) -> Result<(), std::io::Error> {
    let app = router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("starting HTTP server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

fn error_response(status: StatusCode, camera_id: Option<String>, error: String) -> Response {
    (status, Json(ErrorResponse { camera_id, error })).into_response()
}

fn store_error(e: StoreError) -> Response {
    tracing::error!(error = %e, "store request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, None, e.to_string())
}

fn detection_error(camera_id: String, e: DetectionError) -> Response {
    let status = match &e {
        DetectionError::CameraNotFound(_) => StatusCode::NOT_FOUND,
        DetectionError::Resolve(_) | DetectionError::Capture(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DetectionError::Model(_) | DetectionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, Some(camera_id), e.to_string())
}

async fn cameras_handler(State(state): State<AppState>) -> Response {
    match state.cameras.list().await {
        Ok(cameras) => Json(cameras).into_response(),
        Err(e) => store_error(e),
    }
}

async fn alerts_handler(State(state): State<AppState>) -> Response {
    match state.alerts.list().await {
        Ok(alerts) => Json(alerts).into_response(),
        Err(e) => store_error(e),
    }
}

async fn start_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.start(&id).await {
        Ok(outcome) => {
            let message = match outcome {
                StartOutcome::Started => "detection started",
                StartOutcome::AlreadyActive => "detection already active",
            };
            Json(ControlResponse {
                camera_id: id,
                message,
                active: true,
            })
            .into_response()
        }
        Err(e) => detection_error(id, e),
    }
}

async fn stop_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let message = match state.manager.stop(&id).await {
        StopOutcome::Stopped => "detection stopped",
        StopOutcome::NotActive => "detection not active",
    };
    Json(ControlResponse {
        camera_id: id,
        message,
        active: false,
    })
    .into_response()
}

async fn status_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let camera = match state.cameras.get(&id).await {
        Ok(Some(camera)) => camera,
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                Some(id.clone()),
                format!("camera not found: {id}"),
            )
        }
        Err(e) => return store_error(e),
    };

    let session = state.manager.session(&id);
    Json(StatusResponse {
        camera_id: id,
        camera_name: camera.name,
        camera_location: camera.location,
        active: session.is_some(),
        source: session.as_ref().map(|s| s.source.clone()),
        started_at: session.map(|s| s.started_at),
    })
    .into_response()
}
