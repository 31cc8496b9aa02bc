//! PostgreSQL repositories for the governance core.
//!
//! The in-memory key pool and delivery engine remain the authority; these
//! repositories only make daily usage counters, webhook registrations, and
//! delivery history survive a restart.

use std::sync::Arc;

use sqlx::PgPool;

pub mod deliveries;
pub mod usage;
pub mod webhooks;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Daily per-key request counters.
    pub usage: Arc<usage::Repository>,

    /// Webhook registrations.
    pub webhooks: Arc<webhooks::Repository>,

    /// Delivery records and their attempt logs.
    pub deliveries: Arc<deliveries::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            usage: Arc::new(usage::Repository::new(pool.clone())),
            webhooks: Arc::new(webhooks::Repository::new(pool.clone())),
            deliveries: Arc::new(deliveries::Repository::new(pool)),
        }
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.usage.pool()).await?;
        Ok(())
    }

    /// Creates tables and indexes if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns error if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        let pool = self.usage.pool();

        for statement in SCHEMA {
            sqlx::query(statement).execute(&*pool).await?;
        }

        tracing::info!(statements = SCHEMA.len(), "database schema ensured");
        Ok(())
    }
}

// Delivery rows keep a plain webhook_id column without a foreign key: history
// outlives hard-deleted registrations.
const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS provider_key_usage (
        provider TEXT NOT NULL,
        slot_index INTEGER NOT NULL,
        usage_date DATE NOT NULL,
        request_count INTEGER NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (provider, slot_index, usage_date)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS webhooks (
        id UUID PRIMARY KEY,
        owner_id UUID NOT NULL,
        url TEXT NOT NULL,
        events TEXT[] NOT NULL,
        secret TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        failure_count INTEGER NOT NULL DEFAULT 0,
        last_triggered_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhooks_owner_active
    ON webhooks(owner_id)
    WHERE is_active
    ",
    r"
    CREATE TABLE IF NOT EXISTS webhook_deliveries (
        id UUID PRIMARY KEY,
        webhook_id UUID NOT NULL,
        event TEXT NOT NULL,
        payload BYTEA NOT NULL,
        status TEXT NOT NULL,
        last_status_code INTEGER,
        attempts INTEGER NOT NULL DEFAULT 0,
        next_retry_at TIMESTAMPTZ,
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_webhook
    ON webhook_deliveries(webhook_id, created_at DESC)
    ",
    r"
    CREATE TABLE IF NOT EXISTS webhook_delivery_attempts (
        delivery_id UUID NOT NULL REFERENCES webhook_deliveries(id) ON DELETE CASCADE,
        attempt_number INTEGER NOT NULL,
        status_code INTEGER,
        error TEXT,
        attempted_at TIMESTAMPTZ NOT NULL,
        duration_ms BIGINT NOT NULL,
        next_retry_at TIMESTAMPTZ,
        PRIMARY KEY (delivery_id, attempt_number)
    )
    ",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_lazily() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/baatcheet_test").unwrap();
        let _storage = Storage::new(pool);
    }

    #[test]
    fn schema_creates_every_table() {
        let ddl = SCHEMA.join("\n");
        for table in
            ["provider_key_usage", "webhooks", "webhook_deliveries", "webhook_delivery_attempts"]
        {
            assert!(ddl.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")), "{table}");
        }
    }
}
