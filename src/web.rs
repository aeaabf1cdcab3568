use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde_json::json;
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::error::CheckError;
use crate::settings::ServerConfig;
use crate::watcher::{PassReport, Reflector, StatusSnapshot};

#[derive(Clone)]
struct AppState {
    reflector: Reflector,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct AppError(CheckError);

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            CheckError::Busy => StatusCode::CONFLICT,
            CheckError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            CheckError::Connect(_) | CheckError::Fetch(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.reflector.status())
}

async fn check(State(state): State<AppState>) -> Result<Json<PassReport>, AppError> {
    let report = state.reflector.check_once(&state.cancel).await.map_err(|e| {
        warn!("Manual check failed: {}", e);
        AppError(e)
    })?;
    Ok(Json(report))
}

fn create_router(reflector: Reflector, cancel: CancellationToken) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/check", post(check))
        .with_state(AppState { reflector, cancel })
}

/// Serves the status API until `cancel` fires.
pub async fn entrypoint(
    reflector: Reflector,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let router = create_router(reflector, cancel.clone());

    let listener = tokio::net::TcpListener::bind((config.bind.as_str(), config.port)).await?;
    info!("Server running on http://{}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("Server stopped");
    Ok(())
}
