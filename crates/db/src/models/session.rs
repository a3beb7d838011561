use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sparkq_utils::{id, time};
use sqlx::{FromRow, SqliteConnection, SqliteExecutor};
use strum_macros::{Display, EnumString};

use crate::models::project::Project;
use crate::DomainError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

/// A bounded work period grouping queues. Ending is a one-way transition;
/// deletion is a soft delete that cascades to queues and tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSession {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSession {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    project_id: String,
    name: String,
    description: Option<String>,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for Session {
    type Error = DomainError;

    fn try_from(row: SessionRow) -> Result<Self, DomainError> {
        let status = SessionStatus::from_str(&row.status)
            .map_err(|_| DomainError::Internal(anyhow::anyhow!("bad session status {:?}", row.status)))?;
        Ok(Session {
            id: row.id,
            project_id: row.project_id,
            name: row.name,
            description: row.description,
            status,
            started_at: row.started_at,
            ended_at: row.ended_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SESSION_COLUMNS: &str = "id, project_id, name, description, status, started_at, ended_at, created_at, updated_at";

impl Session {
    pub async fn create(
        conn: &mut SqliteConnection,
        data: &CreateSession,
    ) -> Result<Self, DomainError> {
        if data.name.trim().is_empty() {
            return Err(DomainError::validation("session name must not be empty"));
        }
        let project = Project::require(&mut *conn).await?;

        let id = id::generate_id(id::SESSION_PREFIX);
        let now = time::now();
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "INSERT INTO sessions (id, project_id, name, description, status, started_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'active', ?, ?, ?)
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(&id)
        .bind(&project.id)
        .bind(&data.name)
        .bind(&data.description)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| match DomainError::from(e) {
            DomainError::Conflict(_) => {
                DomainError::conflict(format!("session name {:?} is already in use", data.name))
            }
            other => other,
        })?;

        row.try_into()
    }

    pub async fn find_by_id<'e>(
        executor: impl SqliteExecutor<'e>,
        id: &str,
    ) -> Result<Option<Self>, DomainError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await?;
        row.map(Session::try_from).transpose()
    }

    pub async fn find_by_name<'e>(
        executor: impl SqliteExecutor<'e>,
        name: &str,
    ) -> Result<Option<Self>, DomainError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE name = ? AND deleted_at IS NULL"
        ))
        .bind(name)
        .fetch_optional(executor)
        .await?;
        row.map(Session::try_from).transpose()
    }

    pub async fn require<'e>(
        executor: impl SqliteExecutor<'e>,
        id: &str,
    ) -> Result<Self, DomainError> {
        Session::find_by_id(executor, id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("session {id}")))
    }

    /// Sessions newest first, optionally filtered by status.
    pub async fn list<'e>(
        executor: impl SqliteExecutor<'e>,
        status: Option<SessionStatus>,
    ) -> Result<Vec<Self>, DomainError> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, SessionRow>(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE deleted_at IS NULL AND status = ?
                     ORDER BY created_at DESC, id DESC"
                ))
                .bind(status.to_string())
                .fetch_all(executor)
                .await?
            }
            None => {
                sqlx::query_as::<_, SessionRow>(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE deleted_at IS NULL
                     ORDER BY created_at DESC, id DESC"
                ))
                .fetch_all(executor)
                .await?
            }
        };
        rows.into_iter().map(Session::try_from).collect()
    }

    pub async fn update(
        conn: &mut SqliteConnection,
        id: &str,
        data: &UpdateSession,
    ) -> Result<Self, DomainError> {
        let existing = Session::require(&mut *conn, id).await?;
        let name = data.name.clone().unwrap_or(existing.name);
        if name.trim().is_empty() {
            return Err(DomainError::validation("session name must not be empty"));
        }
        let description = data.description.clone().or(existing.description);
        let now = time::now();

        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "UPDATE sessions SET name = ?, description = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(&name)
        .bind(&description)
        .bind(now)
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| match DomainError::from(e) {
            DomainError::Conflict(_) => {
                DomainError::conflict(format!("session name {name:?} is already in use"))
            }
            other => other,
        })?;

        row.try_into()
    }

    /// One-way transition to `ended`. Ending twice is a conflict.
    pub async fn end(conn: &mut SqliteConnection, id: &str) -> Result<Self, DomainError> {
        let now = time::now();
        let updated = sqlx::query(
            "UPDATE sessions SET status = 'ended', ended_at = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL AND status = 'active'",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(DomainError::from)?;

        if updated.rows_affected() == 0 {
            let existing = Session::require(&mut *conn, id).await?;
            return Err(DomainError::conflict(format!(
                "session {} is already {}",
                existing.id, existing.status
            )));
        }
        Session::require(&mut *conn, id).await
    }

    /// Soft-delete the session and cascade: queues go soft-deleted, their
    /// tasks are removed outright.
    pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<(), DomainError> {
        let now = time::now();
        let updated = sqlx::query(
            "UPDATE sessions SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(DomainError::from)?;
        if updated.rows_affected() == 0 {
            return Err(DomainError::not_found(format!("session {id}")));
        }

        sqlx::query(
            "DELETE FROM tasks WHERE queue_id IN (SELECT id FROM queues WHERE session_id = ?)",
        )
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(DomainError::from)?;

        sqlx::query(
            "UPDATE queues SET deleted_at = ?, updated_at = ? WHERE session_id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(DomainError::from)?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::models::project::CreateProject;
    use crate::Db;

    pub async fn project(db: &Db) -> Project {
        db.with_exclusive(|conn| {
            Box::pin(async move {
                Project::create(
                    conn,
                    &CreateProject {
                        name: "cockpit".to_string(),
                        repo_path: None,
                        prd_path: None,
                    },
                )
                .await
            })
        })
        .await
        .expect("create fixture project")
    }

    pub async fn session(db: &Db, name: &str) -> Session {
        let name = name.to_string();
        db.with_exclusive(move |conn| {
            Box::pin(async move {
                Session::create(
                    conn,
                    &CreateSession {
                        name,
                        description: None,
                    },
                )
                .await
            })
        })
        .await
        .expect("create fixture session")
    }
}
