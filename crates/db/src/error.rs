use thiserror::Error;

/// Domain error taxonomy shared by every layer.
///
/// The store and repositories raise these; the HTTP and CLI adapters only
/// translate them. `code()` is the stable machine-readable identifier that
/// crosses the wire.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("store is busy, retry shortly")]
    Busy,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::Validation(_) => "validation",
            DomainError::NotFound(_) => "not_found",
            DomainError::Conflict(_) => "conflict",
            DomainError::Busy => "busy",
            DomainError::Internal(_) => "internal",
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        DomainError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        DomainError::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        DomainError::Conflict(msg.into())
    }
}

// SQLITE_BUSY / SQLITE_LOCKED primary codes plus the extended busy variants
// that can surface once the 5s busy timeout is exhausted.
const SQLITE_BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517"];

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        if matches!(err, sqlx::Error::RowNotFound) {
            return DomainError::NotFound("row".to_string());
        }
        if let sqlx::Error::Database(ref db) = err {
            if db.is_unique_violation() || db.is_foreign_key_violation() || db.is_check_violation()
            {
                return DomainError::Conflict(db.message().to_string());
            }
            if let Some(code) = db.code() {
                if SQLITE_BUSY_CODES.contains(&code.as_ref()) {
                    return DomainError::Busy;
                }
            }
        }
        DomainError::Internal(anyhow::Error::from(err))
    }
}

impl From<sqlx::migrate::MigrateError> for DomainError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DomainError::Internal(anyhow::Error::from(err))
    }
}
