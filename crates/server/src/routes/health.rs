use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sparkq_utils::response::ApiResponse;

use crate::state::{AppState, ServerMode};

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct VersionInfo {
    pub version: String,
}

/// Liveness probe. In production it additionally refuses to report healthy
/// while the served UI build does not match the server build.
pub async fn health(State(state): State<AppState>) -> Response {
    if state.mode() == ServerMode::Production {
        if let Some(ui_build) = state.ui_build_id() {
            if ui_build != state.build_id() {
                let body: ApiResponse<()> = ApiResponse::error(
                    "build_version_mismatch",
                    format!(
                        "ui build {ui_build} does not match server build {}",
                        state.build_id()
                    ),
                );
                return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
            }
        }
    }

    Json(HealthStatus {
        status: "ok",
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
    .into_response()
}

pub async fn version(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-store")],
        Json(ApiResponse::success(VersionInfo {
            version: state.build_id().to_string(),
        })),
    )
}
