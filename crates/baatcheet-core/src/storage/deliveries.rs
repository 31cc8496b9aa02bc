//! Repository for delivery records and their per-attempt audit log.
//!
//! A record is only updated while it is `pending`; terminal records are
//! frozen by the `WHERE status = 'pending'` guard on every update.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeliveryAttemptLog, DeliveryId, DeliveryRecord, DeliveryStatus, WebhookId},
};

/// Repository for `webhook_deliveries` and `webhook_delivery_attempts`.
pub struct Repository {
    pool: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    webhook_id: Uuid,
    event: String,
    payload: Vec<u8>,
    status: String,
    last_status_code: Option<i32>,
    attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeliveryRow> for DeliveryRecord {
    type Error = crate::error::CoreError;

    fn try_from(row: DeliveryRow) -> Result<Self> {
        Ok(Self {
            id: DeliveryId(row.id),
            webhook_id: WebhookId(row.webhook_id),
            event: row.event,
            payload: row.payload,
            status: row.status.parse::<DeliveryStatus>()?,
            last_status_code: row.last_status_code.and_then(|code| u16::try_from(code).ok()),
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    delivery_id: Uuid,
    attempt_number: i32,
    status_code: Option<i32>,
    error: Option<String>,
    attempted_at: DateTime<Utc>,
    duration_ms: i64,
    next_retry_at: Option<DateTime<Utc>>,
}

impl From<AttemptRow> for DeliveryAttemptLog {
    fn from(row: AttemptRow) -> Self {
        Self {
            delivery_id: DeliveryId(row.delivery_id),
            attempt_number: u32::try_from(row.attempt_number).unwrap_or(0),
            status_code: row.status_code.and_then(|code| u16::try_from(code).ok()),
            error: row.error,
            attempted_at: row.attempted_at,
            duration_ms: u64::try_from(row.duration_ms).unwrap_or(0),
            next_retry_at: row.next_retry_at,
        }
    }
}

const SELECT_DELIVERY: &str = "SELECT id, webhook_id, event, payload, status, last_status_code, \
                               attempts, next_retry_at, last_error, created_at, completed_at \
                               FROM webhook_deliveries";

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new delivery record.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, record: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO webhook_deliveries (
                id, webhook_id, event, payload, status, last_status_code, attempts,
                next_retry_at, last_error, created_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(record.id)
        .bind(record.webhook_id)
        .bind(&record.event)
        .bind(&record.payload)
        .bind(record.status.as_str())
        .bind(record.last_status_code.map(i32::from))
        .bind(i32::try_from(record.attempts).unwrap_or(i32::MAX))
        .bind(record.next_retry_at)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.completed_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Writes the mutable fields of a still-pending record.
    ///
    /// Returns `false` if the stored record is already terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update(&self, record: &DeliveryRecord) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE webhook_deliveries
            SET status = $2, last_status_code = $3, attempts = $4, next_retry_at = $5,
                last_error = $6, completed_at = $7
            WHERE id = $1 AND status = 'pending'
            ",
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(record.last_status_code.map(i32::from))
        .bind(i32::try_from(record.attempts).unwrap_or(i32::MAX))
        .bind(record.next_retry_at)
        .bind(&record.last_error)
        .bind(record.completed_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finds a delivery record by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        let row = sqlx::query_as::<_, DeliveryRow>(&format!("{SELECT_DELIVERY} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        row.map(DeliveryRecord::try_from).transpose()
    }

    /// Most recent deliveries for a registration.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_webhook(
        &self,
        webhook_id: WebhookId,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(&format!(
            "{SELECT_DELIVERY} WHERE webhook_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(webhook_id)
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await?;

        rows.into_iter().map(DeliveryRecord::try_from).collect()
    }

    /// Appends one attempt to the audit log.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn record_attempt(&self, attempt: &DeliveryAttemptLog) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO webhook_delivery_attempts (
                delivery_id, attempt_number, status_code, error, attempted_at,
                duration_ms, next_retry_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(attempt.delivery_id)
        .bind(i32::try_from(attempt.attempt_number).unwrap_or(i32::MAX))
        .bind(attempt.status_code.map(i32::from))
        .bind(&attempt.error)
        .bind(attempt.attempted_at)
        .bind(i64::try_from(attempt.duration_ms).unwrap_or(i64::MAX))
        .bind(attempt.next_retry_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Attempts for a delivery in order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_attempts(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttemptLog>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r"
            SELECT delivery_id, attempt_number, status_code, error, attempted_at,
                   duration_ms, next_retry_at
            FROM webhook_delivery_attempts
            WHERE delivery_id = $1
            ORDER BY attempt_number ASC
            ",
        )
        .bind(delivery_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().map(DeliveryAttemptLog::from).collect())
    }
}
