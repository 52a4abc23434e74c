pub mod nudges;
pub mod sent;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Thread-safe SQLite store holding the sent registry and the nudge queue.
/// Timestamps are stored as UTC milliseconds since the epoch.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;

        // Run migrations on the raw connection before wrapping in Mutex.
        Self::run_migrations(&conn)?;

        info!("Store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            -- Recipients that already got a follow-up in the current window
            CREATE TABLE IF NOT EXISTS sent_records (
                recipient TEXT PRIMARY KEY,
                sent_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sent_records_sent_at
                ON sent_records(sent_at);

            -- Recipients a running pass is currently sending to
            CREATE TABLE IF NOT EXISTS send_claims (
                recipient TEXT PRIMARY KEY,
                claimed_at INTEGER NOT NULL
            );

            -- Durable delayed nudges
            CREATE TABLE IF NOT EXISTS pending_nudges (
                id TEXT PRIMARY KEY,
                recipient TEXT NOT NULL,
                message TEXT NOT NULL,
                fire_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                finished_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_pending_nudges_due
                ON pending_nudges(status, fire_at);
            ",
        )
        .context("Failed to run migrations")?;
        Ok(())
    }
}
