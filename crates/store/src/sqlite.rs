//! Embedded SQLite job backend.
//!
//! Single table `jobs (id TEXT PRIMARY KEY, body TEXT)` where `body` is the
//! canonical JSON record. The database file is created on first use; an
//! existing file is used as-is.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;

use crate::backend::{JobBackend, StoreError};

pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (creating if missing) the database file at `path`.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(unavailable)?;
        info!("job store: sqlite backend at {}", path.display());
        Ok(Self { pool })
    }

    /// Ephemeral in-memory database, used by tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(unavailable)?;
        // A single connection keeps every handle on the same database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(unavailable)?;
        Ok(Self { pool })
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl JobBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        sqlx::query("CREATE TABLE IF NOT EXISTS jobs (id TEXT PRIMARY KEY, body TEXT NOT NULL)")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query("SELECT id, body FROM jobs ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("id"), row.get::<String, _>("body")))
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT body FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(row.map(|r| r.get::<String, _>("body")))
    }

    async fn put(&self, id: &str, body: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobs (id, body) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
        )
        .bind(id)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> SqliteBackend {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.bootstrap().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let backend = backend().await;
        backend.bootstrap().await.unwrap();
        assert!(backend.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_replaces_existing_body() {
        let backend = backend().await;
        backend.put("job-1", "{\"v\":1}").await.unwrap();
        backend.put("job-1", "{\"v\":2}").await.unwrap();
        assert_eq!(backend.get("job-1").await.unwrap().unwrap(), "{\"v\":2}");
        assert_eq!(backend.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_all_orders_by_id() {
        let backend = backend().await;
        backend.put("b", "{}").await.unwrap();
        backend.put("a", "{}").await.unwrap();
        backend.put("c", "{}").await.unwrap();
        let ids: Vec<String> = backend
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_file_backend_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        {
            let backend = SqliteBackend::connect(&path).await.unwrap();
            backend.bootstrap().await.unwrap();
            backend.put("job-1", "{\"id\":\"job-1\"}").await.unwrap();
        }
        let backend = SqliteBackend::connect(&path).await.unwrap();
        backend.bootstrap().await.unwrap();
        assert!(backend.get("job-1").await.unwrap().is_some());
    }
}
