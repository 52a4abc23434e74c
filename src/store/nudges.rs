use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::nudge::NudgeScheduler;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingNudge {
    pub id: String,
    pub recipient: String,
    pub message: String,
    pub fire_at: DateTime<Utc>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NudgeStatus {
    Pending,
    Delivered,
    Failed,
}

impl NudgeStatus {
    fn as_str(self) -> &'static str {
        match self {
            NudgeStatus::Pending => "pending",
            NudgeStatus::Delivered => "delivered",
            NudgeStatus::Failed => "failed",
        }
    }
}

/// SQLite-backed delayed nudge queue. Rows outlive the process, so
/// nudges scheduled before a restart still go out afterwards.
#[derive(Clone)]
pub struct NudgeQueue {
    conn: Arc<Mutex<Connection>>,
}

impl NudgeQueue {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub async fn enqueue_at(
        &self,
        recipient: &str,
        message: &str,
        fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO pending_nudges (id, recipient, message, fire_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                &id,
                recipient,
                message,
                fire_at.timestamp_millis(),
                now.timestamp_millis()
            ],
        )
        .context("Failed to enqueue nudge")?;
        Ok(id)
    }

    /// Pending nudges with `fire_at <= now`, oldest first
    pub async fn due_at(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PendingNudge>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, recipient, message, fire_at, attempts
                 FROM pending_nudges
                 WHERE status = 'pending' AND fire_at <= ?1
                 ORDER BY fire_at ASC
                 LIMIT ?2",
            )
            .context("Failed to prepare due nudges query")?;
        let nudges = stmt
            .query_map(
                rusqlite::params![now.timestamp_millis(), limit as i64],
                |row| {
                    let fire_at: i64 = row.get(3)?;
                    Ok(PendingNudge {
                        id: row.get(0)?,
                        recipient: row.get(1)?,
                        message: row.get(2)?,
                        fire_at: DateTime::from_timestamp_millis(fire_at).unwrap_or_default(),
                        attempts: row.get(4)?,
                    })
                },
            )
            .context("Failed to query due nudges")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to collect due nudges")?;
        Ok(nudges)
    }

    pub async fn mark_delivered(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE pending_nudges SET status = ?1, attempts = attempts + 1, finished_at = ?2
             WHERE id = ?3",
            rusqlite::params![
                NudgeStatus::Delivered.as_str(),
                Utc::now().timestamp_millis(),
                id
            ],
        )
        .context("Failed to mark nudge delivered")?;
        Ok(())
    }

    /// Count a failed attempt; the nudge is given up once it reaches
    /// `max_attempts`. Returns the resulting status.
    pub async fn record_failure(
        &self,
        id: &str,
        error: &str,
        max_attempts: u32,
    ) -> Result<NudgeStatus> {
        let conn = self.conn.lock().await;
        let attempts: u32 = conn
            .query_row(
                "UPDATE pending_nudges SET attempts = attempts + 1, last_error = ?1
                 WHERE id = ?2
                 RETURNING attempts",
                rusqlite::params![error, id],
                |row| row.get(0),
            )
            .context("Failed to record nudge failure")?;

        if attempts < max_attempts {
            return Ok(NudgeStatus::Pending);
        }
        conn.execute(
            "UPDATE pending_nudges SET status = ?1, finished_at = ?2 WHERE id = ?3",
            rusqlite::params![
                NudgeStatus::Failed.as_str(),
                Utc::now().timestamp_millis(),
                id
            ],
        )
        .context("Failed to update nudge status")?;
        Ok(NudgeStatus::Failed)
    }

    pub async fn purge_finished_older_than(&self, retention: Duration) -> Result<usize> {
        self.purge_finished_older_than_at(retention, Utc::now()).await
    }

    /// Delete delivered and failed nudges that finished before
    /// `now - retention`. Pending rows are never touched.
    pub async fn purge_finished_older_than_at(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let retention =
            chrono::Duration::from_std(retention).context("Nudge retention too large")?;
        let cutoff = (now - retention).timestamp_millis();

        let conn = self.conn.lock().await;
        let purged = conn
            .execute(
                "DELETE FROM pending_nudges
                 WHERE status IN (?1, ?2) AND finished_at < ?3",
                rusqlite::params![
                    NudgeStatus::Delivered.as_str(),
                    NudgeStatus::Failed.as_str(),
                    cutoff
                ],
            )
            .context("Failed to purge finished nudges")?;
        Ok(purged)
    }

    #[cfg(test)]
    pub async fn count_with_status(&self, status: NudgeStatus) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM pending_nudges WHERE status = ?1",
                rusqlite::params![status.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count nudges")?;
        Ok(count as usize)
    }
}

#[async_trait]
impl NudgeScheduler for NudgeQueue {
    async fn schedule(&self, recipient: &str, message: &str, fire_after: Duration) -> Result<String> {
        let now = Utc::now();
        let delay = chrono::Duration::from_std(fire_after).context("Nudge delay too large")?;
        self.enqueue_at(recipient, message, now + delay, now).await
    }
}
