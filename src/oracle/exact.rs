use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use tracing::debug;

use super::{AddOutcome, BlacklistOracle, RemoveOutcome, validate_url};
use crate::error::MailResult;
use crate::models::BlacklistEntry;

/// Exact lookups against the `blacklist` table, keyed by url.
#[derive(Debug, Clone)]
pub struct ExactSetOracle {
    pool: SqlitePool,
}

impl ExactSetOracle {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn entries(&self) -> MailResult<Vec<BlacklistEntry>> {
        let rows = sqlx::query("SELECT url, created_at, updated_at FROM blacklist ORDER BY url ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| BlacklistEntry {
                url: row.get(0),
                created_at: crate::store::millis_to_datetime(row.get(1)),
                updated_at: crate::store::millis_to_datetime(row.get(2)),
            })
            .collect())
    }
}

#[async_trait]
impl BlacklistOracle for ExactSetOracle {
    async fn is_blacklisted(&self, url: &str) -> MailResult<bool> {
        let url = validate_url(url)?;
        let row = sqlx::query("SELECT 1 FROM blacklist WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn add(&self, url: &str) -> MailResult<AddOutcome> {
        let url = validate_url(url)?;
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO blacklist (url, created_at, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(url) DO NOTHING",
        )
        .bind(url)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let outcome = if result.rows_affected() == 0 {
            AddOutcome::AlreadyPresent
        } else {
            AddOutcome::Added
        };
        debug!(url, ?outcome, "blacklist add");
        Ok(outcome)
    }

    async fn remove(&self, url: &str) -> MailResult<RemoveOutcome> {
        let url = validate_url(url)?;
        let result = sqlx::query("DELETE FROM blacklist WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await?;

        let outcome = if result.rows_affected() == 0 {
            RemoveOutcome::NotFound
        } else {
            RemoveOutcome::Removed
        };
        debug!(url, ?outcome, "blacklist remove");
        Ok(outcome)
    }
}
