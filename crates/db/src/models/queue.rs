use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sparkq_utils::{id, time};
use sqlx::{FromRow, SqliteConnection, SqliteExecutor};
use strum_macros::{Display, EnumString};

use crate::models::session::{Session, SessionStatus};
use crate::DomainError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QueueStatus {
    Active,
    Ended,
    Archived,
}

/// A FIFO lane of tasks within a session.
///
/// `ended` forbids new enqueues but allows draining; `archived` hides the
/// queue from default listings and frees its name. `codex_session_id` is an
/// opaque runner continuation token and is preserved verbatim across end and
/// archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub instructions: Option<String>,
    pub status: QueueStatus,
    pub model_profile: Option<String>,
    pub codex_session_id: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateQueue {
    pub session_id: String,
    pub name: String,
    pub instructions: Option<String>,
    pub model_profile: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateQueue {
    pub name: Option<String>,
    pub instructions: Option<String>,
    pub model_profile: Option<String>,
    pub codex_session_id: Option<String>,
}

#[derive(Debug, FromRow)]
struct QueueRow {
    id: String,
    session_id: String,
    name: String,
    instructions: Option<String>,
    status: String,
    model_profile: Option<String>,
    codex_session_id: Option<String>,
    ended_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<QueueRow> for Queue {
    type Error = DomainError;

    fn try_from(row: QueueRow) -> Result<Self, DomainError> {
        let status = QueueStatus::from_str(&row.status)
            .map_err(|_| DomainError::Internal(anyhow::anyhow!("bad queue status {:?}", row.status)))?;
        Ok(Queue {
            id: row.id,
            session_id: row.session_id,
            name: row.name,
            instructions: row.instructions,
            status,
            model_profile: row.model_profile,
            codex_session_id: row.codex_session_id,
            ended_at: row.ended_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const QUEUE_COLUMNS: &str = "id, session_id, name, instructions, status, model_profile, codex_session_id, ended_at, created_at, updated_at";

impl Queue {
    pub async fn create(
        conn: &mut SqliteConnection,
        data: &CreateQueue,
    ) -> Result<Self, DomainError> {
        if data.name.trim().is_empty() {
            return Err(DomainError::validation("queue name must not be empty"));
        }
        let session = Session::require(&mut *conn, &data.session_id).await?;
        if session.status != SessionStatus::Active {
            return Err(DomainError::conflict(format!(
                "session {} has ended, no new queues",
                session.id
            )));
        }

        let id = id::generate_id(id::QUEUE_PREFIX);
        let now = time::now();
        let row = sqlx::query_as::<_, QueueRow>(&format!(
            "INSERT INTO queues (id, session_id, name, instructions, status, model_profile, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'active', ?, ?, ?)
             RETURNING {QUEUE_COLUMNS}"
        ))
        .bind(&id)
        .bind(&session.id)
        .bind(&data.name)
        .bind(&data.instructions)
        .bind(&data.model_profile)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| match DomainError::from(e) {
            DomainError::Conflict(_) => DomainError::conflict(format!(
                "queue name {:?} is already in use in session {}",
                data.name, session.id
            )),
            other => other,
        })?;

        row.try_into()
    }

    pub async fn find_by_id<'e>(
        executor: impl SqliteExecutor<'e>,
        id: &str,
    ) -> Result<Option<Self>, DomainError> {
        let row = sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queues WHERE id = ? AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await?;
        row.map(Queue::try_from).transpose()
    }

    /// Resolve a live (non-archived) queue by name within a session.
    pub async fn find_by_name<'e>(
        executor: impl SqliteExecutor<'e>,
        session_id: &str,
        name: &str,
    ) -> Result<Option<Self>, DomainError> {
        let row = sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queues
             WHERE session_id = ? AND name = ? AND status != 'archived' AND deleted_at IS NULL"
        ))
        .bind(session_id)
        .bind(name)
        .fetch_optional(executor)
        .await?;
        row.map(Queue::try_from).transpose()
    }

    pub async fn require<'e>(
        executor: impl SqliteExecutor<'e>,
        id: &str,
    ) -> Result<Self, DomainError> {
        Queue::find_by_id(executor, id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("queue {id}")))
    }

    /// Queues newest first. Archived queues are excluded unless asked for.
    pub async fn list<'e>(
        executor: impl SqliteExecutor<'e>,
        session_id: Option<&str>,
        include_archived: bool,
    ) -> Result<Vec<Self>, DomainError> {
        let mut sql = format!("SELECT {QUEUE_COLUMNS} FROM queues WHERE deleted_at IS NULL");
        if session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        if !include_archived {
            sql.push_str(" AND status != 'archived'");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");

        let mut query = sqlx::query_as::<_, QueueRow>(&sql);
        if let Some(session_id) = session_id {
            query = query.bind(session_id);
        }
        let rows = query.fetch_all(executor).await?;
        rows.into_iter().map(Queue::try_from).collect()
    }

    pub async fn update(
        conn: &mut SqliteConnection,
        id: &str,
        data: &UpdateQueue,
    ) -> Result<Self, DomainError> {
        let existing = Queue::require(&mut *conn, id).await?;
        let name = data.name.clone().unwrap_or(existing.name);
        if name.trim().is_empty() {
            return Err(DomainError::validation("queue name must not be empty"));
        }
        let instructions = data.instructions.clone().or(existing.instructions);
        let model_profile = data.model_profile.clone().or(existing.model_profile);
        let codex_session_id = data.codex_session_id.clone().or(existing.codex_session_id);
        let now = time::now();

        let row = sqlx::query_as::<_, QueueRow>(&format!(
            "UPDATE queues
             SET name = ?, instructions = ?, model_profile = ?, codex_session_id = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL
             RETURNING {QUEUE_COLUMNS}"
        ))
        .bind(&name)
        .bind(&instructions)
        .bind(&model_profile)
        .bind(&codex_session_id)
        .bind(now)
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| match DomainError::from(e) {
            DomainError::Conflict(_) => {
                DomainError::conflict(format!("queue name {name:?} is already in use"))
            }
            other => other,
        })?;

        row.try_into()
    }

    /// One-way transition to `ended`; queued tasks keep draining.
    pub async fn end(conn: &mut SqliteConnection, id: &str) -> Result<Self, DomainError> {
        let now = time::now();
        let updated = sqlx::query(
            "UPDATE queues SET status = 'ended', ended_at = ?, updated_at = ?
             WHERE id = ? AND deleted_at IS NULL AND status = 'active'",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(DomainError::from)?;

        if updated.rows_affected() == 0 {
            let existing = Queue::require(&mut *conn, id).await?;
            return Err(DomainError::conflict(format!(
                "queue {} is already {}",
                existing.id, existing.status
            )));
        }
        Queue::require(&mut *conn, id).await
    }

    /// Hide the queue from default listings and release its name.
    pub async fn archive(conn: &mut SqliteConnection, id: &str) -> Result<Self, DomainError> {
        let now = time::now();
        let updated = sqlx::query(
            "UPDATE queues SET status = 'archived', updated_at = ?
             WHERE id = ? AND deleted_at IS NULL AND status IN ('active', 'ended')",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(DomainError::from)?;

        if updated.rows_affected() == 0 {
            let existing = Queue::require(&mut *conn, id).await?;
            return Err(DomainError::conflict(format!(
                "queue {} is already archived",
                existing.id
            )));
        }
        Queue::require(&mut *conn, id).await
    }

    /// Restore an archived queue, back to `ended` when it had ended before
    /// archival, otherwise to `active`. Rejected when a live queue in the
    /// session already holds the name.
    pub async fn unarchive(conn: &mut SqliteConnection, id: &str) -> Result<Self, DomainError> {
        let existing = Queue::require(&mut *conn, id).await?;
        if existing.status != QueueStatus::Archived {
            return Err(DomainError::conflict(format!(
                "queue {} is not archived",
                existing.id
            )));
        }

        let occupied: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queues
             WHERE session_id = ? AND name = ? AND id != ? AND status != 'archived' AND deleted_at IS NULL",
        )
        .bind(&existing.session_id)
        .bind(&existing.name)
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(DomainError::from)?;
        if occupied > 0 {
            return Err(DomainError::conflict(format!(
                "queue name {:?} is already in use in session {}",
                existing.name, existing.session_id
            )));
        }

        let restored = if existing.ended_at.is_some() {
            "ended"
        } else {
            "active"
        };
        let now = time::now();
        sqlx::query("UPDATE queues SET status = ?, updated_at = ? WHERE id = ?")
            .bind(restored)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(DomainError::from)?;

        Queue::require(&mut *conn, id).await
    }

    /// Soft-delete the queue; its tasks are removed outright.
    pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<(), DomainError> {
        let now = time::now();
        let updated = sqlx::query(
            "UPDATE queues SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(DomainError::from)?;
        if updated.rows_affected() == 0 {
            return Err(DomainError::not_found(format!("queue {id}")));
        }

        sqlx::query("DELETE FROM tasks WHERE queue_id = ?")
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
    use crate::Db;

    pub async fn queue(db: &Db, session_id: &str, name: &str) -> Queue {
        let data = CreateQueue {
            session_id: session_id.to_string(),
            name: name.to_string(),
            instructions: None,
            model_profile: None,
        };
        db.with_exclusive(move |conn| Box::pin(async move { Queue::create(conn, &data).await }))
            .await
            .expect("create fixture queue")
    }
}
