use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use sparkq_db::models::session::{CreateSession, Session, SessionStatus, UpdateSession};
use sparkq_db::DomainError;
use sparkq_utils::response::ApiResponse;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SessionListQuery {
    pub status: Option<SessionStatus>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<SessionStatus>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    query: Result<Query<SessionListQuery>, QueryRejection>,
) -> Result<Json<ApiResponse<Vec<Session>>>, ApiError> {
    let Query(query) = query.map_err(|e| DomainError::validation(e.body_text()))?;
    let sessions = Session::list(&state.db().pool, query.status).await?;
    Ok(Json(ApiResponse::success(sessions)))
}

pub async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSession>, JsonRejection>,
) -> Result<Json<ApiResponse<Session>>, ApiError> {
    let Json(payload) = payload.map_err(|e| DomainError::validation(e.body_text()))?;
    let session = state
        .db()
        .with_exclusive(move |conn| Box::pin(async move { Session::create(conn, &payload).await }))
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<Session>>, ApiError> {
    let session = Session::require(&state.db().pool, &session_id).await?;
    Ok(Json(ApiResponse::success(session)))
}

/// `PUT` updates name/description; `status: "ended"` additionally performs
/// the one-way end transition.
pub async fn update_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    payload: Result<Json<UpdateSessionRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Session>>, ApiError> {
    let Json(payload) = payload.map_err(|e| DomainError::validation(e.body_text()))?;
    if payload.status == Some(SessionStatus::Active) {
        return Err(DomainError::validation("status can only be set to \"ended\"").into());
    }

    let session = state
        .db()
        .with_exclusive(move |conn| {
            Box::pin(async move {
                let mut session = if payload.name.is_some() || payload.description.is_some() {
                    Session::update(
                        conn,
                        &session_id,
                        &UpdateSession {
                            name: payload.name.clone(),
                            description: payload.description.clone(),
                        },
                    )
                    .await?
                } else {
                    Session::require(&mut *conn, &session_id).await?
                };
                if payload.status == Some(SessionStatus::Ended) {
                    session = Session::end(conn, &session_id).await?;
                }
                Ok(session)
            })
        })
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state
        .db()
        .with_exclusive(move |conn| {
            Box::pin(async move { Session::delete(conn, &session_id).await })
        })
        .await?;
    Ok(Json(ApiResponse::success(())))
}

pub fn router() -> Router<AppState> {
    let session_id_router = Router::new().route(
        "/",
        get(get_session).put(update_session).delete(delete_session),
    );

    Router::new()
        .route("/", get(list_sessions).post(create_session))
        .nest("/{session_id}", session_id_router)
}
