//! Explicit construction and lifecycle of the governance core.
//!
//! [`App::init`] builds every component in dependency order and starts the
//! background tasks; [`App::shutdown`] stops them and flushes pending usage
//! writes.

use std::sync::Arc;

use anyhow::{Context, Result};
use baatcheet_core::{storage::Storage, Clock, Provider, RealClock};
use baatcheet_delivery::{
    storage::memory::InMemoryWebhookStore, DeliveryEngine, EventDispatcher, PostgresWebhookStore,
    WebhookClient, WebhookRegistry, WebhookStore,
};
use baatcheet_pool::{
    credentials, spawn_daily_reset, storage::memory::InMemoryUsageStore, usage_channel, KeyPool,
    PostgresUsageStore, ProviderSelector, UsageStore,
};
use serde::Serialize;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

/// Snapshot of the running core.
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    /// Whether state survives a restart.
    pub persistent: bool,
    /// Key pool state, secrets masked.
    pub pool: baatcheet_pool::PoolStats,
    /// Delivery counters.
    pub delivery: baatcheet_delivery::EngineStats,
}

/// Running governance core.
pub struct App {
    config: Config,
    pool: Arc<KeyPool>,
    selector: ProviderSelector,
    registry: Arc<WebhookRegistry>,
    dispatcher: EventDispatcher,
    database: Option<PgPool>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Builds the core with the real clock and credentials from the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied or the webhook
    /// client cannot be built.
    pub async fn init(config: Config, database: Option<PgPool>) -> Result<Self> {
        Self::init_with(config, database, std::env::vars(), Arc::new(RealClock::new())).await
    }

    /// Builds the core from explicit credentials and clock.
    ///
    /// `vars` are `(name, value)` pairs scanned for provider keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied or the webhook
    /// client cannot be built.
    pub async fn init_with<I, K, V>(
        config: Config,
        database: Option<PgPool>,
        vars: I,
        clock: Arc<dyn Clock>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let cancel = CancellationToken::new();

        let (usage_store, webhook_store): (Arc<dyn UsageStore>, Arc<dyn WebhookStore>) = match &database {
            Some(db) => {
                let storage = Arc::new(Storage::new(db.clone()));
                storage.migrate().await.context("Failed to apply database schema")?;
                info!("Database schema ready");
                (
                    Arc::new(PostgresUsageStore::new(storage.clone())),
                    Arc::new(PostgresWebhookStore::new(storage)),
                )
            },
            None => {
                warn!("No database configured; usage counters and webhooks are kept in memory and lost on restart");
                (Arc::new(InMemoryUsageStore::new()), Arc::new(InMemoryWebhookStore::new()))
            },
        };

        let (recorder, writer) = usage_channel(config.usage_queue_capacity, usage_store.clone());
        let keys = credentials::provider_keys(vars, |provider| config.daily_limit(provider));
        let pool = KeyPool::new(keys, clock.clone()).with_recorder(recorder);

        match pool.seed_from(usage_store.as_ref()).await {
            Ok(seeded) => info!(seeded, "Key usage restored"),
            Err(e) => warn!(error = %e, "Failed to restore key usage; starting from zero"),
        }

        let mut configured = 0;
        for provider in Provider::ALL {
            let keys = pool.key_count(provider).await;
            if keys > 0 {
                configured += 1;
                info!(provider = %provider, keys, "Provider keys loaded");
            }
        }
        if configured == 0 {
            warn!("No provider keys found in the environment; every selection will come back empty");
        }

        let pool = Arc::new(pool);
        let tasks = vec![
            writer.spawn(cancel.clone()),
            spawn_daily_reset(pool.clone(), usage_store, config.reset_check_interval(), cancel.clone()),
        ];

        let selector = ProviderSelector::new(pool.clone());
        let registry = Arc::new(WebhookRegistry::new(webhook_store.clone(), clock.clone()));
        let client = WebhookClient::new(config.to_client_config()).context("Failed to build webhook client")?;
        let engine = DeliveryEngine::new(webhook_store, client, clock, config.to_engine_config(), cancel.clone());
        let dispatcher = EventDispatcher::new(registry.clone(), engine);

        Ok(Self { config, pool, selector, registry, dispatcher, database, cancel, tasks })
    }

    /// Loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Multi-key provider pool.
    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    /// Task-type provider selection.
    pub fn selector(&self) -> &ProviderSelector {
        &self.selector
    }

    /// Webhook registrations.
    pub fn registry(&self) -> &Arc<WebhookRegistry> {
        &self.registry
    }

    /// Event fan-out and test deliveries.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Pool and delivery snapshot.
    pub async fn status(&self) -> AppStatus {
        AppStatus {
            persistent: self.database.is_some(),
            pool: self.pool.stats().await,
            delivery: self.dispatcher.engine().stats().await,
        }
    }

    /// Stops background tasks, abandons pending retries, and closes the
    /// database.
    pub async fn shutdown(self) {
        info!("Shutting down governance core");
        self.cancel.cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task ended abnormally");
            }
        }

        if let Some(database) = self.database {
            database.close().await;
            info!("Database connections closed");
        }
    }
}
