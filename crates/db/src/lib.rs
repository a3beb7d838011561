pub mod error;
pub mod models;
pub mod pagination;

use std::path::Path;
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};

pub use error::DomainError;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Handle to the embedded store. Cheap to clone; all components share one.
#[derive(Clone)]
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    /// Open (creating if missing) the database file, apply pending
    /// migrations, and return a pooled handle.
    ///
    /// WAL journaling plus a 5 second busy timeout lets readers share a
    /// snapshot while writers queue behind the exclusive transaction
    /// primitive below.
    pub async fn connect(path: &Path) -> Result<Self, DomainError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| DomainError::Internal(anyhow::Error::from(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so concurrent writers serialize
    /// here instead of failing midway through. Commits on `Ok`, rolls back
    /// on `Err`. Callers must not await network I/O inside `f`.
    pub async fn with_exclusive<T>(
        &self,
        f: impl for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, DomainError>>,
    ) -> Result<T, DomainError> {
        let mut conn = self.pool.acquire().await.map_err(DomainError::from)?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(DomainError::from)?;

        match f(&mut *conn).await {
            Ok(value) => match sqlx::query("COMMIT").execute(&mut *conn).await {
                Ok(_) => Ok(value),
                Err(commit_err) => {
                    // The connection must not rejoin the pool with an open
                    // transaction; detaching drops the physical connection.
                    drop(conn.detach());
                    Err(DomainError::from(commit_err))
                }
            },
            Err(err) => {
                if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    tracing::warn!("rollback after failed exclusive transaction: {rollback_err}");
                    drop(conn.detach());
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// File-backed database so every pooled connection sees the same data.
    pub async fn test_db() -> (Db, TempDir) {
        let dir = TempDir::new().expect("create temp dir");
        let db = Db::connect(&dir.path().join("sparkq.db"))
            .await
            .expect("open test database");
        (db, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_db;
    use super::*;

    #[tokio::test]
    async fn exclusive_transaction_commits_on_ok() {
        let (db, _dir) = test_db().await;

        db.with_exclusive(|conn| {
            Box::pin(async move {
                sqlx::query("INSERT INTO projects (id, name, created_at, updated_at) VALUES ('proj_0000000000aa', 'p', '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00')")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .await
        .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn exclusive_transaction_rolls_back_on_err() {
        let (db, _dir) = test_db().await;

        let result: Result<(), DomainError> = db
            .with_exclusive(|conn| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO projects (id, name, created_at, updated_at) VALUES ('proj_0000000000ab', 'p', '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00')")
                        .execute(&mut *conn)
                        .await?;
                    Err(DomainError::conflict("forced"))
                })
            })
            .await;
        assert!(result.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0, "rolled-back insert must not be visible");
    }

    #[tokio::test]
    async fn migrations_are_idempotent_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sparkq.db");
        drop(Db::connect(&path).await.unwrap());
        // Second open re-runs the migrator against the applied set.
        let db = Db::connect(&path).await.unwrap();
        let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(applied, 3);
    }
}
