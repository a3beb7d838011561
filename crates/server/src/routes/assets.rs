use std::path::{Component, Path as FsPath};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::state::{AppState, ServerMode};

/// Hashed asset URLs are content-addressed, so production pins them for a
/// year; dev always revalidates. HTML is never cached in either mode, which
/// is what makes query-string cache busters unnecessary.
const IMMUTABLE: &str = "public, max-age=31536000, immutable";
const NO_STORE: &str = "no-store";

pub async fn index(State(state): State<AppState>) -> Response {
    let Some(dir) = state.assets_dir() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    serve_file(&dir.join("index.html"), NO_STORE).await
}

pub async fn asset(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let Some(dir) = state.assets_dir() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let relative = FsPath::new(&path);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return StatusCode::NOT_FOUND.into_response();
    }

    let is_html = path.ends_with(".html");
    let cache = if is_html || state.mode() == ServerMode::Dev {
        NO_STORE
    } else {
        IMMUTABLE
    };
    serve_file(&dir.join("assets").join(relative), cache).await
}

async fn serve_file(path: &FsPath, cache: &'static str) -> Response {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            (
                [
                    (header::CONTENT_TYPE, mime.as_ref().to_string()),
                    (header::CACHE_CONTROL, cache.to_string()),
                ],
                bytes,
            )
                .into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/assets/{*path}", get(asset))
}
