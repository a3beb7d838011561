use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sparkq_utils::{id, time};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqliteExecutor, SqlitePool};
use strum_macros::{Display, EnumString};

use crate::pagination::{CursorToken, Page, TaskListParams, Window};
use crate::DomainError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// Timeout bucket a task belongs to. Default timeouts per class come from
/// configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskClass {
    FastScript,
    MediumScript,
    LlmLite,
    LlmHeavy,
}

/// A single unit of work. `payload` and `result` are opaque JSON at this
/// layer; contracts on their shape are enforced by the lifecycle engine.
///
/// `started_at` is the historical alias for `claimed_at`; both are stamped
/// together on claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub queue_id: String,
    pub tool_name: String,
    pub task_class: TaskClass,
    pub payload: Value,
    pub status: TaskStatus,
    pub timeout: i64,
    pub attempts: i64,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stale_warned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields the repository needs to insert a task. Ids and timestamps are
/// allocated here, not by the caller.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub queue_id: String,
    pub tool_name: String,
    pub task_class: TaskClass,
    pub payload: Value,
    pub timeout_seconds: i64,
}

/// Task joined with its queue name, the shape list endpoints return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWithQueue {
    #[serde(flatten)]
    pub task: Task,
    pub queue_name: String,
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: String,
    queue_id: String,
    tool_name: String,
    task_class: String,
    payload: String,
    status: String,
    timeout_seconds: i64,
    attempts: i64,
    result: Option<String>,
    error: Option<String>,
    stdout: Option<String>,
    stderr: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    stale_warned_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct TaskListRow {
    #[sqlx(flatten)]
    task: TaskRow,
    queue_name: String,
    sort_key: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, DomainError> {
        let status = TaskStatus::from_str(&row.status)
            .map_err(|_| DomainError::Internal(anyhow::anyhow!("bad task status {:?}", row.status)))?;
        let task_class = TaskClass::from_str(&row.task_class).map_err(|_| {
            DomainError::Internal(anyhow::anyhow!("bad task class {:?}", row.task_class))
        })?;
        let payload: Value = serde_json::from_str(&row.payload)
            .map_err(|e| DomainError::Internal(anyhow::anyhow!("bad task payload: {e}")))?;
        let result: Option<Value> = row
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| DomainError::Internal(anyhow::anyhow!("bad task result: {e}")))?;

        Ok(Task {
            id: row.id,
            queue_id: row.queue_id,
            tool_name: row.tool_name,
            task_class,
            payload,
            status,
            timeout: row.timeout_seconds,
            attempts: row.attempts,
            result,
            error: row.error,
            stdout: row.stdout,
            stderr: row.stderr,
            claimed_at: row.claimed_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            stale_warned_at: row.stale_warned_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const TASK_COLUMNS: &str = "id, queue_id, tool_name, task_class, payload, status, timeout_seconds, attempts, result, error, stdout, stderr, claimed_at, started_at, finished_at, stale_warned_at, created_at, updated_at";

const TASK_COLUMNS_QUALIFIED: &str = "t.id, t.queue_id, t.tool_name, t.task_class, t.payload, t.status, t.timeout_seconds, t.attempts, t.result, t.error, t.stdout, t.stderr, t.claimed_at, t.started_at, t.finished_at, t.stale_warned_at, t.created_at, t.updated_at";

impl Task {
    /// Insert a fresh `queued` task. Queue/session state checks belong to
    /// the lifecycle engine; this only guards the row-level invariants.
    pub async fn insert(conn: &mut SqliteConnection, data: &NewTask) -> Result<Self, DomainError> {
        if data.timeout_seconds <= 0 {
            return Err(DomainError::validation("timeout must be > 0 seconds"));
        }
        if data.tool_name.trim().is_empty() {
            return Err(DomainError::validation("tool_name must not be empty"));
        }
        let payload = serde_json::to_string(&data.payload)
            .map_err(|e| DomainError::Internal(anyhow::anyhow!("serialize payload: {e}")))?;

        let id = id::generate_id(id::TASK_PREFIX);
        // Full-precision creation stamp: the id tie-breaker is random, so
        // same-second enqueues would otherwise lose FIFO order.
        let now = Utc::now();
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "INSERT INTO tasks (id, queue_id, tool_name, task_class, payload, status, timeout_seconds, attempts, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'queued', ?, 0, ?, ?)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(&id)
        .bind(&data.queue_id)
        .bind(&data.tool_name)
        .bind(data.task_class.to_string())
        .bind(&payload)
        .bind(data.timeout_seconds)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        row.try_into()
    }

    pub async fn find_by_id<'e>(
        executor: impl SqliteExecutor<'e>,
        id: &str,
    ) -> Result<Option<Self>, DomainError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(executor)
        .await?;
        row.map(Task::try_from).transpose()
    }

    pub async fn require<'e>(
        executor: impl SqliteExecutor<'e>,
        id: &str,
    ) -> Result<Self, DomainError> {
        Task::find_by_id(executor, id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("task {id}")))
    }

    /// Head of the queue: oldest `queued` task by `(created_at, id)`.
    pub async fn oldest_queued<'e>(
        executor: impl SqliteExecutor<'e>,
        queue_id: &str,
    ) -> Result<Option<Self>, DomainError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE queue_id = ? AND status = 'queued'
             ORDER BY created_at ASC, id ASC
             LIMIT 1"
        ))
        .bind(queue_id)
        .fetch_optional(executor)
        .await?;
        row.map(Task::try_from).transpose()
    }

    /// Atomically claim the oldest queued task in a queue.
    ///
    /// The claim is one conditional UPDATE over a subselect; under
    /// `with_exclusive` at most one contender can win a given task, the
    /// rest see zero rows and get `None`.
    pub async fn claim_next(
        conn: &mut SqliteConnection,
        queue_id: &str,
    ) -> Result<Option<Self>, DomainError> {
        let now = time::now();
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE tasks
             SET status = 'running', claimed_at = ?2, started_at = ?2, attempts = attempts + 1, updated_at = ?2
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE queue_id = ?1 AND status = 'queued'
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1
             ) AND status = 'queued'
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(queue_id)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(Task::try_from).transpose()
    }

    /// Claim one specific task. Zero matched rows is the definitive
    /// lost-race signal and surfaces as `NotFound` so callers back off.
    pub async fn claim(conn: &mut SqliteConnection, id: &str) -> Result<Self, DomainError> {
        let now = time::now();
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE tasks
             SET status = 'running', claimed_at = ?2, started_at = ?2, attempts = attempts + 1, updated_at = ?2
             WHERE id = ?1 AND status = 'queued'
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(DomainError::not_found(format!("claimable task {id}"))),
        }
    }

    /// Transition `running` -> `succeeded`. Result shape validation happens
    /// in the lifecycle engine before this runs.
    pub async fn complete(
        conn: &mut SqliteConnection,
        id: &str,
        result: &Value,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<Self, DomainError> {
        let result_json = serde_json::to_string(result)
            .map_err(|e| DomainError::Internal(anyhow::anyhow!("serialize result: {e}")))?;
        let now = time::now();
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE tasks
             SET status = 'succeeded', result = ?2, stdout = COALESCE(?3, stdout),
                 stderr = COALESCE(?4, stderr), finished_at = ?5, updated_at = ?5
             WHERE id = ?1 AND status = 'running'
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(&result_json)
        .bind(stdout)
        .bind(stderr)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(Task::wrong_state(conn, id, TaskStatus::Running).await),
        }
    }

    /// Transition `running` -> `failed`. `stdout`/`stderr` already captured
    /// on the row are preserved when the caller passes `None`.
    pub async fn fail(
        conn: &mut SqliteConnection,
        id: &str,
        error: &str,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<Self, DomainError> {
        if error.trim().is_empty() {
            return Err(DomainError::validation("error must not be empty"));
        }
        let now = time::now();
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "UPDATE tasks
             SET status = 'failed', error = ?2, stdout = COALESCE(?3, stdout),
                 stderr = COALESCE(?4, stderr), finished_at = ?5, updated_at = ?5
             WHERE id = ?1 AND status = 'running'
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(id)
        .bind(error)
        .bind(stdout)
        .bind(stderr)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(Task::wrong_state(conn, id, TaskStatus::Running).await),
        }
    }

    /// Explain a zero-row conditional update: missing row is NotFound, a row
    /// in the wrong state is Conflict.
    async fn wrong_state(
        conn: &mut SqliteConnection,
        id: &str,
        expected: TaskStatus,
    ) -> DomainError {
        match Task::find_by_id(&mut *conn, id).await {
            Ok(Some(task)) => DomainError::conflict(format!(
                "task {} is {}, expected {}",
                task.id, task.status, expected
            )),
            Ok(None) => DomainError::not_found(format!("task {id}")),
            Err(err) => err,
        }
    }

    /// All running tasks, oldest claim first. Janitor scan input.
    pub async fn running<'e>(executor: impl SqliteExecutor<'e>) -> Result<Vec<Self>, DomainError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'running'
             ORDER BY claimed_at ASC, id ASC"
        ))
        .fetch_all(executor)
        .await?;
        rows.into_iter().map(Task::try_from).collect()
    }

    /// Stamp `stale_warned_at` once. Returns false when another pass beat
    /// us to it or the task left `running`.
    pub async fn mark_stale_warned(
        conn: &mut SqliteConnection,
        id: &str,
    ) -> Result<bool, DomainError> {
        let now = time::now();
        let updated = sqlx::query(
            "UPDATE tasks SET stale_warned_at = ?, updated_at = ?
             WHERE id = ? AND status = 'running' AND stale_warned_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(DomainError::from)?;
        Ok(updated.rows_affected() > 0)
    }

    /// Delete terminal tasks created before the cutoff. Returns the number
    /// of rows removed.
    pub async fn purge_terminal_before(
        conn: &mut SqliteConnection,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DomainError> {
        let deleted = sqlx::query(
            "DELETE FROM tasks WHERE status IN ('succeeded', 'failed') AND created_at < ?",
        )
        .bind(cutoff)
        .execute(&mut *conn)
        .await
        .map_err(DomainError::from)?;
        Ok(deleted.rows_affected())
    }

    /// Paginated, filtered, stably ordered task listing.
    pub async fn list(
        pool: &SqlitePool,
        params: &TaskListParams,
    ) -> Result<Page<TaskWithQueue>, DomainError> {
        let resolved = params.resolve()?;

        let mut count_qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COUNT(*) FROM tasks t JOIN queues q ON q.id = t.queue_id WHERE q.deleted_at IS NULL",
        );
        push_filters(&mut count_qb, params);
        let total_count: i64 = count_qb
            .build_query_scalar()
            .fetch_one(pool)
            .await
            .map_err(DomainError::from)?;

        let sort_expr = resolved.sort_by.sql_expr();
        let dir = resolved.sort_dir.sql();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {TASK_COLUMNS_QUALIFIED}, q.name AS queue_name, {sort_expr} AS sort_key
             FROM tasks t JOIN queues q ON q.id = t.queue_id
             WHERE q.deleted_at IS NULL"
        ));
        push_filters(&mut qb, params);

        if let Window::Cursor(token) = &resolved.window {
            let cmp = match resolved.sort_dir {
                crate::pagination::SortDir::Asc => ">",
                crate::pagination::SortDir::Desc => "<",
            };
            qb.push(format!(" AND ({sort_expr} {cmp} "));
            qb.push_bind(&token.k);
            qb.push(format!(" OR ({sort_expr} = "));
            qb.push_bind(&token.k);
            qb.push(format!(" AND t.id {cmp} "));
            qb.push_bind(&token.id);
            qb.push("))");
        }

        qb.push(format!(" ORDER BY {sort_expr} {dir}, t.id {dir} LIMIT "));
        qb.push_bind(resolved.limit + 1);
        if let Window::Offset(offset) = resolved.window {
            qb.push(" OFFSET ");
            qb.push_bind(offset);
        }

        let rows: Vec<TaskListRow> = qb
            .build_query_as()
            .fetch_all(pool)
            .await
            .map_err(DomainError::from)?;

        let truncated = rows.len() as i64 > resolved.limit;
        let mut items = Vec::with_capacity(rows.len().min(resolved.limit as usize));
        let mut last_sort_key = None;
        for row in rows.into_iter().take(resolved.limit as usize) {
            last_sort_key = Some((row.sort_key.clone(), row.task.id.clone()));
            items.push(TaskWithQueue {
                queue_name: row.queue_name.clone(),
                task: row.task.try_into()?,
            });
        }

        let (offset, next_cursor) = match resolved.window {
            Window::Offset(offset) => {
                let next_cursor = if truncated && !resolved.explicit_offset {
                    last_sort_key.as_ref().map(|(k, id)| {
                        CursorToken {
                            k: k.clone(),
                            id: id.clone(),
                            f: resolved.fingerprint.clone(),
                        }
                        .encode()
                    })
                } else {
                    None
                };
                (Some(offset), next_cursor)
            }
            Window::Cursor(_) => {
                let next_cursor = if truncated {
                    last_sort_key.as_ref().map(|(k, id)| {
                        CursorToken {
                            k: k.clone(),
                            id: id.clone(),
                            f: resolved.fingerprint.clone(),
                        }
                        .encode()
                    })
                } else {
                    None
                };
                (None, next_cursor)
            }
        };

        Ok(Page {
            items,
            limit: resolved.limit,
            offset,
            next_cursor,
            total_count,
            truncated,
        })
    }
}

fn push_filters<'a>(qb: &mut QueryBuilder<'a, Sqlite>, params: &'a TaskListParams) {
    if let Some(queue_id) = &params.queue_id {
        qb.push(" AND t.queue_id = ");
        qb.push_bind(queue_id);
    }
    if let Some(session_id) = &params.session_id {
        qb.push(" AND q.session_id = ");
        qb.push_bind(session_id);
    }
    if let Some(status) = params.status {
        qb.push(" AND t.status = ");
        qb.push_bind(status.to_string());
    }
}
