//! SQLite metadata store: the `rules` and `nodes` tables.
//!
//! The store is the externally observable state of the agent. Tests and
//! operator tooling read it directly, so every commit point keeps it in
//! line with what the mounted directory shows.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::info;

pub mod models;
pub mod types;

/// Connection pool over the agent's metadata database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl std::ops::Deref for Database {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

/// Errors that can occur when opening the database.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),
}

impl Database {
    /// Open (or create) the database file at `path` and bring the schema up to date.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Migration(format!("failed to create database directory: {}", e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::Integrity(e.to_string()))?;

        let db = Self { pool };
        db.check_integrity().await?;
        db.run_migrations().await?;

        info!("metadata store opened at {:?}", path);
        Ok(db)
    }

    /// In-memory database; a single connection keeps the data alive.
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn check_integrity(&self) -> Result<(), DatabaseError> {
        let row = sqlx::query("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DatabaseError::Integrity(e.to_string()))?;
        let verdict: String = row
            .try_get(0)
            .map_err(|e| DatabaseError::Integrity(e.to_string()))?;
        if verdict != "ok" {
            return Err(DatabaseError::Integrity(verdict));
        }
        Ok(())
    }

    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY NOT NULL,
                local_root TEXT NOT NULL UNIQUE,
                remote_target TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                rule_id TEXT NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
                path TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0 CHECK (size >= 0),
                local INTEGER NOT NULL DEFAULT 1,
                pending TEXT NOT NULL DEFAULT 'NONE',
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (rule_id, path),
                CHECK ((local = 1 AND pending = 'NONE') OR (local = 0 AND pending = 'REMOTE'))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_nodes_rule ON nodes(rule_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        Ok(())
    }

    /// Close the pool, flushing outstanding writes.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
