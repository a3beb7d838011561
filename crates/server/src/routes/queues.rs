use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use sparkq_db::models::queue::{CreateQueue, Queue, QueueStatus, UpdateQueue};
use sparkq_db::DomainError;
use sparkq_utils::response::ApiResponse;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct QueueListQuery {
    pub session_id: Option<String>,
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateQueueRequest {
    pub name: Option<String>,
    pub instructions: Option<String>,
    pub model_profile: Option<String>,
    pub codex_session_id: Option<String>,
    pub status: Option<QueueStatus>,
}

pub async fn list_queues(
    State(state): State<AppState>,
    query: Result<Query<QueueListQuery>, QueryRejection>,
) -> Result<Json<ApiResponse<Vec<Queue>>>, ApiError> {
    let Query(query) = query.map_err(|e| DomainError::validation(e.body_text()))?;
    let queues = Queue::list(
        &state.db().pool,
        query.session_id.as_deref(),
        query.include_archived,
    )
    .await?;
    Ok(Json(ApiResponse::success(queues)))
}

pub async fn create_queue(
    State(state): State<AppState>,
    payload: Result<Json<CreateQueue>, JsonRejection>,
) -> Result<Json<ApiResponse<Queue>>, ApiError> {
    let Json(payload) = payload.map_err(|e| DomainError::validation(e.body_text()))?;
    let queue = state
        .db()
        .with_exclusive(move |conn| Box::pin(async move { Queue::create(conn, &payload).await }))
        .await?;
    Ok(Json(ApiResponse::success(queue)))
}

pub async fn get_queue(
    State(state): State<AppState>,
    Path(queue_id): Path<String>,
) -> Result<Json<ApiResponse<Queue>>, ApiError> {
    let queue = Queue::require(&state.db().pool, &queue_id).await?;
    Ok(Json(ApiResponse::success(queue)))
}

/// `PUT` updates metadata; `status: "ended"` additionally performs the
/// one-way end transition. Archival has its own endpoints.
pub async fn update_queue(
    State(state): State<AppState>,
    Path(queue_id): Path<String>,
    payload: Result<Json<UpdateQueueRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Queue>>, ApiError> {
    let Json(payload) = payload.map_err(|e| DomainError::validation(e.body_text()))?;
    match payload.status {
        None | Some(QueueStatus::Ended) => {}
        Some(_) => {
            return Err(DomainError::validation(
                "status can only be set to \"ended\", use the archive endpoints otherwise",
            )
            .into())
        }
    }

    let queue = state
        .db()
        .with_exclusive(move |conn| {
            Box::pin(async move {
                let has_field_updates = payload.name.is_some()
                    || payload.instructions.is_some()
                    || payload.model_profile.is_some()
                    || payload.codex_session_id.is_some();
                let mut queue = if has_field_updates {
                    Queue::update(
                        conn,
                        &queue_id,
                        &UpdateQueue {
                            name: payload.name.clone(),
                            instructions: payload.instructions.clone(),
                            model_profile: payload.model_profile.clone(),
                            codex_session_id: payload.codex_session_id.clone(),
                        },
                    )
                    .await?
                } else {
                    Queue::require(&mut *conn, &queue_id).await?
                };
                if payload.status == Some(QueueStatus::Ended) {
                    queue = Queue::end(conn, &queue_id).await?;
                }
                Ok(queue)
            })
        })
        .await?;
    Ok(Json(ApiResponse::success(queue)))
}

pub async fn archive_queue(
    State(state): State<AppState>,
    Path(queue_id): Path<String>,
) -> Result<Json<ApiResponse<Queue>>, ApiError> {
    let queue = state
        .db()
        .with_exclusive(move |conn| Box::pin(async move { Queue::archive(conn, &queue_id).await }))
        .await?;
    Ok(Json(ApiResponse::success(queue)))
}

pub async fn unarchive_queue(
    State(state): State<AppState>,
    Path(queue_id): Path<String>,
) -> Result<Json<ApiResponse<Queue>>, ApiError> {
    let queue = state
        .db()
        .with_exclusive(move |conn| {
            Box::pin(async move { Queue::unarchive(conn, &queue_id).await })
        })
        .await?;
    Ok(Json(ApiResponse::success(queue)))
}

pub async fn delete_queue(
    State(state): State<AppState>,
    Path(queue_id): Path<String>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state
        .db()
        .with_exclusive(move |conn| Box::pin(async move { Queue::delete(conn, &queue_id).await }))
        .await?;
    Ok(Json(ApiResponse::success(())))
}

pub fn router() -> Router<AppState> {
    let queue_id_router = Router::new()
        .route("/", get(get_queue).put(update_queue).delete(delete_queue))
        .route("/archive", put(archive_queue))
        .route("/unarchive", put(unarchive_queue));

    Router::new()
        .route("/", get(list_queues).post(create_queue))
        .nest("/{queue_id}", queue_id_router)
}
