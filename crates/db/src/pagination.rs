use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum_macros::{Display, EnumString};

use crate::models::task::TaskStatus;
use crate::DomainError;

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 500;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskSortBy {
    CreatedAt,
    StartedAt,
    FinishedAt,
    Status,
    QueueName,
}

impl TaskSortBy {
    /// SQL expression for the sort key. Nullable keys collapse to '' so the
    /// ordering (and the cursor comparison against it) stays total.
    pub(crate) fn sql_expr(self) -> &'static str {
        match self {
            TaskSortBy::CreatedAt => "t.created_at",
            TaskSortBy::StartedAt => "COALESCE(t.started_at, '')",
            TaskSortBy::FinishedAt => "COALESCE(t.finished_at, '')",
            TaskSortBy::Status => "t.status",
            TaskSortBy::QueueName => "q.name",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// Raw task-list inputs as they arrive from the transport layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub cursor: Option<String>,
    pub sort_by: Option<TaskSortBy>,
    pub sort_dir: Option<SortDir>,
    pub queue_id: Option<String>,
    pub session_id: Option<String>,
    pub status: Option<TaskStatus>,
}

#[derive(Debug)]
pub(crate) enum Window {
    Offset(i64),
    Cursor(CursorToken),
}

#[derive(Debug)]
pub(crate) struct ResolvedTaskList {
    pub limit: i64,
    pub sort_by: TaskSortBy,
    pub sort_dir: SortDir,
    pub window: Window,
    /// True when the caller passed `offset` explicitly; suppresses
    /// `next_cursor` in the response.
    pub explicit_offset: bool,
    pub fingerprint: String,
}

impl TaskListParams {
    pub(crate) fn resolve(&self) -> Result<ResolvedTaskList, DomainError> {
        let limit = match self.limit {
            None => DEFAULT_LIMIT,
            Some(l) if (1..=MAX_LIMIT).contains(&l) => l,
            Some(l) => {
                return Err(DomainError::validation(format!(
                    "limit {l} is out of range, expected 1..={MAX_LIMIT}"
                )))
            }
        };
        if self.offset.is_some() && self.cursor.is_some() {
            return Err(DomainError::validation(
                "offset and cursor are mutually exclusive",
            ));
        }
        if let Some(offset) = self.offset {
            if offset < 0 {
                return Err(DomainError::validation("offset must be >= 0"));
            }
        }

        let sort_by = self.sort_by.unwrap_or(TaskSortBy::CreatedAt);
        let sort_dir = self.sort_dir.unwrap_or(SortDir::Desc);
        let fingerprint = self.fingerprint(sort_by, sort_dir);

        let window = match &self.cursor {
            Some(raw) => {
                let token = CursorToken::decode(raw)?;
                if token.f != fingerprint {
                    return Err(DomainError::validation(
                        "cursor does not match the active sort and filter set",
                    ));
                }
                Window::Cursor(token)
            }
            None => Window::Offset(self.offset.unwrap_or(0)),
        };

        Ok(ResolvedTaskList {
            limit,
            sort_by,
            sort_dir,
            window,
            explicit_offset: self.offset.is_some(),
            fingerprint,
        })
    }

    /// Stable digest over everything that shapes the ordering. A cursor
    /// minted under one sort+filter set refuses to resume under another.
    fn fingerprint(&self, sort_by: TaskSortBy, sort_dir: SortDir) -> String {
        let canonical = format!(
            "{sort_by}|{sort_dir}|{}|{}|{}",
            self.queue_id.as_deref().unwrap_or(""),
            self.session_id.as_deref().unwrap_or(""),
            self.status.map(|s| s.to_string()).unwrap_or_default(),
        );
        let digest = Sha256::digest(canonical.as_bytes());
        hex_prefix(&digest, 8)
    }
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes.iter().take(n).fold(String::new(), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// Opaque pagination cursor: last sort key, last id (tie-breaker), and the
/// fingerprint of the sort+filter set it was minted under.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CursorToken {
    pub k: String,
    pub id: String,
    pub f: String,
}

impl CursorToken {
    pub(crate) fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub(crate) fn decode(raw: &str) -> Result<Self, DomainError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|_| DomainError::validation("malformed cursor"))?;
        serde_json::from_slice(&bytes).map_err(|_| DomainError::validation("malformed cursor"))
    }
}

/// One window of a list result.
#[derive(Debug, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub limit: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub total_count: i64,
    pub truncated: bool,
}
