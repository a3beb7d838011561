use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use sparkq_db::models::task::{Task, TaskWithQueue};
use sparkq_db::pagination::{Page, TaskListParams, MAX_LIMIT};
use sparkq_db::DomainError;
use sparkq_services::services::lifecycle::{CompleteRequest, EnqueueRequest, FailRequest};
use sparkq_utils::response::ApiResponse;

use crate::error::ApiError;
use crate::state::AppState;

/// Paginated task listing. An out-of-range limit is rejected and the
/// response reports the documented `max_limit` ceiling.
pub async fn list_tasks(
    State(state): State<AppState>,
    query: Result<Query<TaskListParams>, QueryRejection>,
) -> Result<Json<ApiResponse<Page<TaskWithQueue>>>, ApiError> {
    let Query(params) = query.map_err(|e| DomainError::validation(e.body_text()))?;
    let page = Task::list(&state.db().pool, &params).await.map_err(|e| {
        if matches!(&e, DomainError::Validation(msg) if msg.starts_with("limit")) {
            ApiError::with_max_limit(e, MAX_LIMIT)
        } else {
            e.into()
        }
    })?;
    Ok(Json(ApiResponse::success(page)))
}

pub async fn create_task(
    State(state): State<AppState>,
    payload: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Task>>, ApiError> {
    let Json(payload) = payload.map_err(|e| DomainError::validation(e.body_text()))?;
    let config = state.config().get();
    let task = state.engine().enqueue(payload, &config.config).await?;
    tracing::debug!(task = %task.id, queue = %task.queue_id, "task enqueued");
    Ok(Json(ApiResponse::success(task)))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<Task>>, ApiError> {
    let task = Task::require(&state.db().pool, &task_id).await?;
    Ok(Json(ApiResponse::success(task)))
}

/// Claim a specific task. A 404 here is the lost-race signal runners back
/// off on.
pub async fn claim_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<Task>>, ApiError> {
    let task = state.engine().claim(&task_id).await?;
    tracing::debug!(task = %task.id, attempts = task.attempts, "task claimed");
    Ok(Json(ApiResponse::success(task)))
}

pub async fn complete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Task>>, ApiError> {
    let Json(payload) = payload.map_err(|e| DomainError::validation(e.body_text()))?;
    let task = state.engine().complete(&task_id, payload).await?;
    Ok(Json(ApiResponse::success(task)))
}

pub async fn fail_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    payload: Result<Json<FailRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Task>>, ApiError> {
    let Json(payload) = payload.map_err(|e| DomainError::validation(e.body_text()))?;
    let task = state.engine().fail(&task_id, payload).await?;
    Ok(Json(ApiResponse::success(task)))
}

pub async fn requeue_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<Task>>, ApiError> {
    let task = state.engine().requeue(&task_id).await?;
    tracing::debug!(source = %task_id, replacement = %task.id, "task requeued");
    Ok(Json(ApiResponse::success(task)))
}

pub fn router() -> Router<AppState> {
    let task_id_router = Router::new()
        .route("/", get(get_task))
        .route("/claim", post(claim_task))
        .route("/complete", post(complete_task))
        .route("/fail", post(fail_task))
        .route("/requeue", post(requeue_task));

    Router::new()
        .route("/", get(list_tasks).post(create_task))
        .nest("/{task_id}", task_id_router)
}
