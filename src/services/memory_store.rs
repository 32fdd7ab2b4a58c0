//! SQLite-backed agent memory store.
//!
//! Holds conversation sessions per agent. The orchestrator only needs the
//! pruning surface: after each run, a service trims its session list to the
//! configured cap, oldest first.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

/// Errors from the memory store.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("failed to create memory directory: {0}")]
    Directory(#[source] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

const CREATE_SESSIONS: &str = "\
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_name TEXT NOT NULL,
    session_id TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (agent_name, session_id)
)";

const CREATE_SESSION_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_sessions_agent ON sessions (agent_name, updated_at)";

/// Session store shared by the agents of one compose (or owned by one role).
pub struct MemoryStore {
    pool: SqlitePool,
}

impl MemoryStore {
    /// Open (creating if missing) the store at `path`.
    pub async fn open(path: &Path) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(MemoryError::Directory)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(CREATE_SESSIONS).execute(&pool).await?;
        sqlx::query(CREATE_SESSION_INDEX).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Record (or touch) a session for an agent.
    pub async fn touch_session(&self, agent_name: &str, session_id: &str) -> Result<(), MemoryError> {
        sqlx::query(
            "INSERT INTO sessions (agent_name, session_id, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (agent_name, session_id) DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(agent_name)
        .bind(session_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Trim an agent's sessions to the most recent `max_sessions`. Returns
    /// the number of sessions removed.
    pub async fn prune_sessions(&self, agent_name: &str, max_sessions: usize) -> Result<u64, MemoryError> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE agent_name = ? AND id NOT IN
             (SELECT id FROM sessions WHERE agent_name = ?
              ORDER BY updated_at DESC, id DESC LIMIT ?)",
        )
        .bind(agent_name)
        .bind(agent_name)
        .bind(max_sessions as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Number of sessions currently stored for an agent.
    pub async fn session_count(&self, agent_name: &str) -> Result<u64, MemoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sessions WHERE agent_name = ?")
            .bind(agent_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prune_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(&dir.path().join("memory.db")).await.unwrap();

        for i in 0..5 {
            store.touch_session("worker", &format!("s{i}")).await.unwrap();
        }
        assert_eq!(store.session_count("worker").await.unwrap(), 5);

        let removed = store.prune_sessions("worker", 2).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.session_count("worker").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_prune_scoped_per_agent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(&dir.path().join("memory.db")).await.unwrap();

        store.touch_session("a", "s1").await.unwrap();
        store.touch_session("b", "s1").await.unwrap();
        store.prune_sessions("a", 0).await.unwrap();

        assert_eq!(store.session_count("a").await.unwrap(), 0);
        assert_eq!(store.session_count("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_touch_is_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(&dir.path().join("memory.db")).await.unwrap();

        store.touch_session("a", "s1").await.unwrap();
        store.touch_session("a", "s1").await.unwrap();
        assert_eq!(store.session_count("a").await.unwrap(), 1);
    }
}
