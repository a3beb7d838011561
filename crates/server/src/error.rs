use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use sparkq_db::DomainError;
use sparkq_utils::response::ApiResponse;

/// Transport adapter for [`DomainError`]. The mapping is mechanical; no
/// business rules live here and no domain error is ever collapsed into a
/// generic 500.
#[derive(Debug)]
pub struct ApiError {
    error: DomainError,
    max_limit: Option<i64>,
}

impl ApiError {
    /// Attach the documented ceiling to a limit validation error so the
    /// response carries `max_limit`.
    pub fn with_max_limit(error: DomainError, max_limit: i64) -> Self {
        Self {
            error,
            max_limit: Some(max_limit),
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(error: DomainError) -> Self {
        Self {
            error,
            max_limit: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.error {
            DomainError::Validation(_) => StatusCode::BAD_REQUEST,
            DomainError::NotFound(_) => StatusCode::NOT_FOUND,
            DomainError::Conflict(_) => StatusCode::CONFLICT,
            DomainError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            DomainError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let code = self.error.code();
        let message = match &self.error {
            // Detail stays in the logs; clients get a generic line.
            DomainError::Internal(source) => {
                tracing::error!("internal error: {source:#}");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let body: ApiResponse<()> = match self.max_limit {
            Some(max) => ApiResponse::error_with_max_limit(code, message, max),
            None => ApiResponse::error(code, message),
        };

        if status == StatusCode::SERVICE_UNAVAILABLE {
            (status, [(header::RETRY_AFTER, "1")], Json(body)).into_response()
        } else {
            (status, Json(body)).into_response()
        }
    }
}
