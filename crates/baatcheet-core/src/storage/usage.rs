//! Repository for daily per-key usage counters.
//!
//! Rows are keyed by (provider, slot index, date). The key pool reads today's
//! partition once at startup and upserts on every acquisition.

use std::sync::Arc;

use chrono::NaiveDate;
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{KeyUsage, Provider},
};

/// Repository for `provider_key_usage`.
pub struct Repository {
    pool: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct UsageRow {
    provider: String,
    slot_index: i32,
    usage_date: NaiveDate,
    request_count: i32,
}

impl TryFrom<UsageRow> for KeyUsage {
    type Error = CoreError;

    fn try_from(row: UsageRow) -> Result<Self> {
        Ok(Self {
            provider: row.provider.parse::<Provider>()?,
            slot_index: u32::try_from(row.slot_index)
                .map_err(|_| CoreError::invalid_input("negative slot index"))?,
            usage_date: row.usage_date,
            request_count: u32::try_from(row.request_count).unwrap_or(0),
        })
    }
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Loads every counter recorded for `date`.
    ///
    /// Rows naming providers this build no longer knows are skipped with a
    /// warning rather than failing startup.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_date(&self, date: NaiveDate) -> Result<Vec<KeyUsage>> {
        let rows = sqlx::query_as::<_, UsageRow>(
            r"
            SELECT provider, slot_index, usage_date, request_count
            FROM provider_key_usage
            WHERE usage_date = $1
            ORDER BY provider, slot_index
            ",
        )
        .bind(date)
        .fetch_all(&*self.pool)
        .await?;

        let mut usage = Vec::with_capacity(rows.len());
        for row in rows {
            match KeyUsage::try_from(row) {
                Ok(entry) => usage.push(entry),
                Err(error) => tracing::warn!(%error, "skipping unreadable usage row"),
            }
        }
        Ok(usage)
    }

    /// Writes the count for one slot and day.
    ///
    /// Writes may arrive out of order from the background queue, so the
    /// stored count never decreases within a day.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert(&self, usage: &KeyUsage) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO provider_key_usage (provider, slot_index, usage_date, request_count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (provider, slot_index, usage_date) DO UPDATE
            SET request_count = GREATEST(provider_key_usage.request_count, EXCLUDED.request_count),
                updated_at = NOW()
            ",
        )
        .bind(usage.provider.as_str())
        .bind(i32::try_from(usage.slot_index).unwrap_or(i32::MAX))
        .bind(usage.usage_date)
        .bind(i32::try_from(usage.request_count).unwrap_or(i32::MAX))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Deletes partitions older than `date`.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_before(&self, date: NaiveDate) -> Result<u64> {
        let result = sqlx::query("DELETE FROM provider_key_usage WHERE usage_date < $1")
            .bind(date)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
