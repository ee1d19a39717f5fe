use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::PathBuf;

pub mod sessions;

pub use sessions::SessionRepository;

/// Handle to the SQLite database. Cheap to clone; a fresh connection is
/// opened per operation so it can be shared across tasks without holding a
/// non-Send connection across awaits.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Database at the default data-dir location.
    pub fn open_default() -> Result<Self> {
        Ok(Self {
            path: crate::global::db_file()?,
        })
    }

    /// Database at an explicit path (used by tests).
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn =
            Connection::open(&self.path).context("Failed to open database connection")?;

        migrate(&conn)?;

        Ok(conn)
    }
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            meeting_id TEXT PRIMARY KEY,
            meet_url TEXT NOT NULL,
            meet_external_id TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            status TEXT NOT NULL,
            transcript TEXT,
            bot_session_id TEXT,
            delivery_attempts INTEGER NOT NULL DEFAULT 0,
            delivery_status TEXT NOT NULL DEFAULT 'pending',
            last_error TEXT,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )
    .context("Failed to create sessions table")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS delivery_attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            meeting_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            success INTEGER NOT NULL,
            detail TEXT,
            attempted_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )
    .context("Failed to create delivery_attempts table")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scheduler_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )
    .context("Failed to create scheduler_state table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)",
        [],
    )
    .context("Failed to create index on sessions.status")?;

    Ok(())
}

pub fn get_scheduler_state(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn
        .prepare("SELECT value FROM scheduler_state WHERE key = ?1")
        .context("Failed to prepare scheduler state query")?;

    let mut rows = stmt
        .query_map([key], |row| row.get::<_, String>(0))
        .context("Failed to query scheduler state")?;

    match rows.next() {
        Some(Ok(value)) => Ok(Some(value)),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

pub fn set_scheduler_state(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO scheduler_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )
    .context("Failed to write scheduler state")?;
    Ok(())
}
