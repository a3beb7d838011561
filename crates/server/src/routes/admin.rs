use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use sparkq_db::DomainError;
use sparkq_utils::response::ApiResponse;

use crate::error::ApiError;
use crate::state::AppState;

/// Re-read the active configuration document and swap it in.
pub async fn reload(State(state): State<AppState>) -> Result<Json<ApiResponse<Value>>, ApiError> {
    let fresh = state
        .config()
        .reload()
        .map_err(|e| DomainError::validation(format!("config reload failed: {e}")))?;
    tracing::info!(source = ?fresh.source_path, "configuration reloaded");
    Ok(Json(ApiResponse::success(json!({
        "reloaded": true,
        "source": fresh.source_path,
    }))))
}

/// Begin a graceful shutdown: stop accepting requests, let in-flight ones
/// finish, cancel the janitors.
pub async fn shutdown(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    tracing::info!("shutdown requested over the API");
    state.shutdown_token().cancel();
    Json(ApiResponse::success(json!({ "stopping": true })))
}
