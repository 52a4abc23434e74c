use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Persisted set of recipients that already received a follow-up.
///
/// A recipient is suppressed while it has a sent record, or while another
/// pass holds a send claim on it. Records are only removed by
/// [`SentRegistry::evict_older_than`]; inserting an existing recipient
/// leaves its `sent_at` untouched so repeated passes never extend the
/// suppression.
#[derive(Clone)]
pub struct SentRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SentRegistry {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub async fn exists(&self, recipient: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sent_records WHERE recipient = ?1)
                     OR EXISTS(SELECT 1 FROM send_claims WHERE recipient = ?1)",
                rusqlite::params![recipient],
                |row| row.get(0),
            )
            .context("Failed to check sent registry")?;
        Ok(exists)
    }

    /// When the recipient was recorded, if it is
    #[cfg(test)]
    pub async fn sent_at(&self, recipient: &str) -> Result<Option<DateTime<Utc>>> {
        use rusqlite::OptionalExtension;

        let conn = self.conn.lock().await;
        let millis: Option<i64> = conn
            .query_row(
                "SELECT sent_at FROM sent_records WHERE recipient = ?1",
                rusqlite::params![recipient],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read sent record")?;
        Ok(millis.and_then(DateTime::from_timestamp_millis))
    }

    /// Reserve `recipient` for a send. Returns false if it already has a
    /// record or another pass holds the claim.
    pub async fn claim(&self, recipient: &str) -> Result<bool> {
        self.claim_at(recipient, Utc::now()).await
    }

    pub async fn claim_at(&self, recipient: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin claim transaction")?;

        let already_sent: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM sent_records WHERE recipient = ?1)",
            rusqlite::params![recipient],
            |row| row.get(0),
        )?;
        if already_sent {
            return Ok(false);
        }

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO send_claims (recipient, claimed_at) VALUES (?1, ?2)",
                rusqlite::params![recipient, at.timestamp_millis()],
            )
            .context("Failed to insert send claim")?;
        tx.commit().context("Failed to commit send claim")?;

        Ok(inserted == 1)
    }

    /// Drop a claim after a failed send so the next pass can retry.
    pub async fn release(&self, recipient: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM send_claims WHERE recipient = ?1",
            rusqlite::params![recipient],
        )
        .context("Failed to release send claim")?;
        Ok(())
    }

    pub async fn insert_many(&self, recipients: &[String]) -> Result<usize> {
        self.insert_many_at(recipients, Utc::now()).await
    }

    /// Record `recipients` as sent at `at` and clear their claims.
    /// Returns how many recipients were newly recorded.
    pub async fn insert_many_at(&self, recipients: &[String], at: DateTime<Utc>) -> Result<usize> {
        if recipients.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin insert transaction")?;

        let mut inserted = 0;
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO sent_records (recipient, sent_at) VALUES (?1, ?2)",
            )?;
            let mut unclaim = tx.prepare("DELETE FROM send_claims WHERE recipient = ?1")?;
            for recipient in recipients {
                inserted += insert
                    .execute(rusqlite::params![recipient, at.timestamp_millis()])
                    .with_context(|| format!("Failed to record {}", recipient))?;
                unclaim.execute(rusqlite::params![recipient])?;
            }
        }

        tx.commit().context("Failed to commit sent records")?;
        Ok(inserted)
    }

    pub async fn evict_older_than(&self, window: Duration) -> Result<usize> {
        self.evict_older_than_at(window, Utc::now()).await
    }

    /// Delete records (and stale claims) older than `now - window`.
    /// Returns the number of sent records removed.
    pub async fn evict_older_than_at(&self, window: Duration, now: DateTime<Utc>) -> Result<usize> {
        let window = chrono::Duration::from_std(window).context("Suppression window too large")?;
        let cutoff = (now - window).timestamp_millis();

        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin eviction transaction")?;
        let evicted = tx
            .execute(
                "DELETE FROM sent_records WHERE sent_at < ?1",
                rusqlite::params![cutoff],
            )
            .context("Failed to evict sent records")?;
        tx.execute(
            "DELETE FROM send_claims WHERE claimed_at < ?1",
            rusqlite::params![cutoff],
        )
        .context("Failed to evict stale claims")?;
        tx.commit().context("Failed to commit eviction")?;

        Ok(evicted)
    }

    pub async fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT count(*) FROM sent_records", [], |row| row.get(0))
            .context("Failed to count sent records")?;
        Ok(count as usize)
    }
}
