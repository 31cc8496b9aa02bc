//! Repository for webhook registrations.
//!
//! Ownership checks are part of every mutating query so a registration can
//! only be changed by the owner that created it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{OwnerId, Webhook, WebhookEventKind, WebhookId},
};

/// Result of recording a terminal delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureTally {
    /// Cumulative failure count after the increment.
    pub failure_count: u32,
    /// Whether the registration is still active.
    pub active: bool,
}

/// Owner edit of a registration. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookChanges {
    /// Replacement target URL, already validated.
    pub url: Option<String>,
    /// Replacement subscription list, already validated.
    pub events: Option<Vec<WebhookEventKind>>,
    /// New active flag. Turning an inactive registration on clears its
    /// failure count.
    pub active: Option<bool>,
}

/// Repository for `webhooks`.
pub struct Repository {
    pool: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    owner_id: Uuid,
    url: String,
    events: Vec<String>,
    secret: String,
    is_active: bool,
    failure_count: i32,
    last_triggered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WebhookRow> for Webhook {
    type Error = CoreError;

    fn try_from(row: WebhookRow) -> Result<Self> {
        let events = row
            .events
            .iter()
            .map(|event| event.parse::<WebhookEventKind>())
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: WebhookId(row.id),
            owner_id: OwnerId(row.owner_id),
            url: row.url,
            events,
            secret: row.secret,
            active: row.is_active,
            failure_count: u32::try_from(row.failure_count).unwrap_or(0),
            last_triggered_at: row.last_triggered_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, owner_id, url, events, secret, is_active, failure_count, \
                              last_triggered_at, created_at, updated_at FROM webhooks";

fn event_names(events: &[WebhookEventKind]) -> Vec<String> {
    events.iter().map(|event| event.as_str().to_string()).collect()
}

fn to_webhooks(rows: Vec<WebhookRow>) -> Result<Vec<Webhook>> {
    rows.into_iter().map(Webhook::try_from).collect()
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

    /// Inserts a new registration.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails or the id already exists.
    pub async fn create(&self, webhook: &Webhook) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO webhooks (
                id, owner_id, url, events, secret, is_active, failure_count,
                last_triggered_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(webhook.id)
        .bind(webhook.owner_id)
        .bind(&webhook.url)
        .bind(event_names(&webhook.events))
        .bind(&webhook.secret)
        .bind(webhook.active)
        .bind(i32::try_from(webhook.failure_count).unwrap_or(i32::MAX))
        .bind(webhook.last_triggered_at)
        .bind(webhook.created_at)
        .bind(webhook.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a registration by id regardless of owner.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: WebhookId) -> Result<Option<Webhook>> {
        let row = sqlx::query_as::<_, WebhookRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        row.map(Webhook::try_from).transpose()
    }

    /// Lists an owner's registrations, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, WebhookRow>(&format!(
            "{SELECT_COLUMNS} WHERE owner_id = $1 ORDER BY created_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(&*self.pool)
        .await?;

        to_webhooks(rows)
    }

    /// Active registrations of `owner_id` subscribed to `event`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_subscribed(
        &self,
        owner_id: OwnerId,
        event: WebhookEventKind,
    ) -> Result<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, WebhookRow>(&format!(
            "{SELECT_COLUMNS} WHERE owner_id = $1 AND is_active AND $2 = ANY(events) \
             ORDER BY created_at ASC"
        ))
        .bind(owner_id)
        .bind(event.as_str())
        .fetch_all(&*self.pool)
        .await?;

        to_webhooks(rows)
    }

    /// Applies an owner edit and returns the stored registration.
    ///
    /// Only supplied fields change; the failure count is reset in the same
    /// statement when an inactive registration is switched on. Returns
    /// `None` when no registration with that id belongs to `owner_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update(
        &self,
        id: WebhookId,
        owner_id: OwnerId,
        changes: &WebhookChanges,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Webhook>> {
        let row = sqlx::query_as::<_, WebhookRow>(
            r"
            UPDATE webhooks
            SET url = COALESCE($3, url),
                events = COALESCE($4, events),
                failure_count = CASE WHEN $5 IS TRUE AND NOT is_active THEN 0 ELSE failure_count END,
                is_active = COALESCE($5, is_active),
                updated_at = $6
            WHERE id = $1 AND owner_id = $2
            RETURNING id, owner_id, url, events, secret, is_active, failure_count,
                      last_triggered_at, created_at, updated_at
            ",
        )
        .bind(id)
        .bind(owner_id)
        .bind(changes.url.as_deref())
        .bind(changes.events.as_deref().map(event_names))
        .bind(changes.active)
        .bind(updated_at)
        .fetch_optional(&*self.pool)
        .await?;

        row.map(Webhook::try_from).transpose()
    }

    /// Hard-deletes a registration owned by `owner_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete(&self, id: WebhookId, owner_id: OwnerId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = $1 AND owner_id = $2")
            .bind(id)
            .bind(owner_id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Clears the failure count and stamps the last successful delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn record_success(&self, id: WebhookId, delivered_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r"
            UPDATE webhooks
            SET failure_count = 0, last_triggered_at = $2, updated_at = $2
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(delivered_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Increments the failure count and deactivates the registration once it
    /// reaches `disable_threshold`, in one statement.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the registration no longer exists.
    pub async fn record_failure(
        &self,
        id: WebhookId,
        disable_threshold: u32,
        failed_at: DateTime<Utc>,
    ) -> Result<FailureTally> {
        let (failure_count, active): (i32, bool) = sqlx::query_as(
            r"
            UPDATE webhooks
            SET failure_count = failure_count + 1,
                is_active = CASE WHEN failure_count + 1 >= $2 THEN FALSE ELSE is_active END,
                updated_at = $3
            WHERE id = $1
            RETURNING failure_count, is_active
            ",
        )
        .bind(id)
        .bind(i32::try_from(disable_threshold).unwrap_or(i32::MAX))
        .bind(failed_at)
        .fetch_optional(&*self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("webhook {id}")))?;

        Ok(FailureTally { failure_count: u32::try_from(failure_count).unwrap_or(0), active })
    }
}
