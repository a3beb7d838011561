use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sparkq_utils::{id, time};
use sqlx::{FromRow, SqliteConnection, SqliteExecutor};

use crate::DomainError;

/// The singleton project row. Created once by `setup`; a second creation is
/// a conflict.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repo_path: Option<String>,
    pub prd_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProject {
    pub name: String,
    pub repo_path: Option<String>,
    pub prd_path: Option<String>,
}

const PROJECT_COLUMNS: &str = "id, name, repo_path, prd_path, created_at, updated_at";

impl Project {
    pub async fn create(
        conn: &mut SqliteConnection,
        data: &CreateProject,
    ) -> Result<Self, DomainError> {
        if data.name.trim().is_empty() {
            return Err(DomainError::validation("project name must not be empty"));
        }
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(&mut *conn)
            .await
            .map_err(DomainError::from)?;
        if existing > 0 {
            return Err(DomainError::conflict("project already initialized"));
        }

        let id = id::generate_id(id::PROJECT_PREFIX);
        let now = time::now();
        let project = sqlx::query_as::<_, Project>(&format!(
            "INSERT INTO projects (id, name, repo_path, prd_path, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(&id)
        .bind(&data.name)
        .bind(&data.repo_path)
        .bind(&data.prd_path)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        Ok(project)
    }

    pub async fn get<'e>(executor: impl SqliteExecutor<'e>) -> Result<Option<Self>, DomainError> {
        Ok(sqlx::query_as::<_, Project>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects LIMIT 1"
        ))
        .fetch_optional(executor)
        .await?)
    }

    /// The project row, or a conflict telling the operator to run setup.
    pub async fn require<'e>(executor: impl SqliteExecutor<'e>) -> Result<Self, DomainError> {
        Project::get(executor)
            .await?
            .ok_or_else(|| DomainError::conflict("project not initialized, run setup first"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_db;

    fn sample() -> CreateProject {
        CreateProject {
            name: "cockpit".to_string(),
            repo_path: Some("/work/cockpit".to_string()),
            prd_path: None,
        }
    }

    #[tokio::test]
    async fn create_and_get_singleton() {
        let (db, _dir) = test_db().await;

        let created = db
            .with_exclusive(|conn| Box::pin(async move { Project::create(conn, &sample()).await }))
            .await
            .unwrap();
        assert!(created.id.starts_with("proj_"));

        let fetched = Project::get(&db.pool).await.unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.repo_path.as_deref(), Some("/work/cockpit"));
    }

    #[tokio::test]
    async fn second_create_conflicts() {
        let (db, _dir) = test_db().await;

        db.with_exclusive(|conn| Box::pin(async move { Project::create(conn, &sample()).await }))
            .await
            .unwrap();

        let err = db
            .with_exclusive(|conn| Box::pin(async move { Project::create(conn, &sample()).await }))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[tokio::test]
    async fn require_without_setup_is_conflict() {
        let (db, _dir) = test_db().await;
        let err = Project::require(&db.pool).await.unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }
}
