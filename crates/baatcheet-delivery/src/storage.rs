//! Storage abstraction for registrations and delivery records.
//!
//! The registry, engine, and dispatcher work against [`WebhookStore`] so the
//! delivery logic can be exercised without a database. Production wraps the
//! PostgreSQL repositories from `baatcheet_core::storage`.

use std::sync::Arc;

use async_trait::async_trait;
use baatcheet_core::{
    error::Result,
    storage::{
        webhooks::{FailureTally, WebhookChanges},
        Storage,
    },
    DeliveryAttemptLog, DeliveryId, DeliveryRecord, OwnerId, Webhook, WebhookEventKind, WebhookId,
};
use chrono::{DateTime, Utc};

/// Storage operations required by the delivery side.
#[async_trait]
pub trait WebhookStore: Send + Sync + 'static {
    /// Inserts a new registration.
    async fn insert_webhook(&self, webhook: &Webhook) -> Result<()>;

    /// Registration by id, regardless of owner.
    async fn find_webhook(&self, id: WebhookId) -> Result<Option<Webhook>>;

    /// All registrations of an owner, newest first.
    async fn find_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Webhook>>;

    /// Active registrations of an owner subscribed to `event`.
    async fn find_subscribed(&self, owner_id: OwnerId, event: WebhookEventKind) -> Result<Vec<Webhook>>;

    /// Applies an owner edit in one step and returns the stored result.
    ///
    /// Only supplied fields change. Switching an inactive registration on
    /// clears its failure count. Returns `None` if no registration with that
    /// id belongs to `owner_id`.
    async fn update_webhook(
        &self,
        id: WebhookId,
        owner_id: OwnerId,
        changes: &WebhookChanges,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Webhook>>;

    /// Hard-deletes an owned registration. Returns `false` if nothing matched.
    async fn delete_webhook(&self, id: WebhookId, owner_id: OwnerId) -> Result<bool>;

    /// Resets the failure count and stamps `last_triggered_at`.
    async fn record_success(&self, id: WebhookId, delivered_at: DateTime<Utc>) -> Result<()>;

    /// Atomically increments the failure count, deactivating the
    /// registration when it reaches `disable_threshold`.
    async fn record_failure(
        &self,
        id: WebhookId,
        disable_threshold: u32,
        failed_at: DateTime<Utc>,
    ) -> Result<FailureTally>;

    /// Inserts a new delivery record.
    async fn insert_delivery(&self, record: &DeliveryRecord) -> Result<()>;

    /// Updates a pending record. Returns `false` if it is already terminal.
    async fn update_delivery(&self, record: &DeliveryRecord) -> Result<bool>;

    /// Delivery record by id.
    async fn find_delivery(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>>;

    /// Appends one attempt to the audit log.
    async fn record_attempt(&self, attempt: &DeliveryAttemptLog) -> Result<()>;

    /// Attempts of a delivery in order.
    async fn find_attempts(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttemptLog>>;
}

/// Production storage using PostgreSQL.
pub struct PostgresWebhookStore {
    storage: Arc<Storage>,
}

impl PostgresWebhookStore {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl WebhookStore for PostgresWebhookStore {
    async fn insert_webhook(&self, webhook: &Webhook) -> Result<()> {
        self.storage.webhooks.create(webhook).await
    }

    async fn find_webhook(&self, id: WebhookId) -> Result<Option<Webhook>> {
        self.storage.webhooks.find_by_id(id).await
    }

    async fn find_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Webhook>> {
        self.storage.webhooks.find_by_owner(owner_id).await
    }

    async fn find_subscribed(&self, owner_id: OwnerId, event: WebhookEventKind) -> Result<Vec<Webhook>> {
        self.storage.webhooks.find_subscribed(owner_id, event).await
    }

    async fn update_webhook(
        &self,
        id: WebhookId,
        owner_id: OwnerId,
        changes: &WebhookChanges,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Webhook>> {
        self.storage.webhooks.update(id, owner_id, changes, updated_at).await
    }

    async fn delete_webhook(&self, id: WebhookId, owner_id: OwnerId) -> Result<bool> {
        self.storage.webhooks.delete(id, owner_id).await
    }

    async fn record_success(&self, id: WebhookId, delivered_at: DateTime<Utc>) -> Result<()> {
        self.storage.webhooks.record_success(id, delivered_at).await
    }

    async fn record_failure(
        &self,
        id: WebhookId,
        disable_threshold: u32,
        failed_at: DateTime<Utc>,
    ) -> Result<FailureTally> {
        self.storage.webhooks.record_failure(id, disable_threshold, failed_at).await
    }

    async fn insert_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        self.storage.deliveries.create(record).await
    }

    async fn update_delivery(&self, record: &DeliveryRecord) -> Result<bool> {
        self.storage.deliveries.update(record).await
    }

    async fn find_delivery(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        self.storage.deliveries.find_by_id(id).await
    }

    async fn record_attempt(&self, attempt: &DeliveryAttemptLog) -> Result<()> {
        self.storage.deliveries.record_attempt(attempt).await
    }

    async fn find_attempts(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttemptLog>> {
        self.storage.deliveries.find_attempts(delivery_id).await
    }
}

pub mod memory {
    //! In-memory store for tests and database-less deployments.

    use std::collections::HashMap;

    use baatcheet_core::CoreError;
    use tokio::sync::RwLock;

    use super::*;

    /// Webhook store holding everything in maps. Contents are lost on
    /// restart.
    #[derive(Debug, Default)]
    pub struct InMemoryWebhookStore {
        webhooks: RwLock<HashMap<WebhookId, Webhook>>,
        deliveries: RwLock<HashMap<DeliveryId, DeliveryRecord>>,
        attempts: RwLock<Vec<DeliveryAttemptLog>>,
    }

    impl InMemoryWebhookStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Delivery records of a registration, oldest first.
        pub async fn deliveries_for(&self, webhook_id: WebhookId) -> Vec<DeliveryRecord> {
            let mut records: Vec<DeliveryRecord> = self
                .deliveries
                .read()
                .await
                .values()
                .filter(|record| record.webhook_id == webhook_id)
                .cloned()
                .collect();
            records.sort_by_key(|record| record.created_at);
            records
        }

        /// Number of stored delivery records.
        pub async fn delivery_count(&self) -> usize {
            self.deliveries.read().await.len()
        }
    }

    #[async_trait]
    impl WebhookStore for InMemoryWebhookStore {
        async fn insert_webhook(&self, webhook: &Webhook) -> Result<()> {
            let mut webhooks = self.webhooks.write().await;
            if webhooks.contains_key(&webhook.id) {
                return Err(CoreError::ConstraintViolation(format!("webhook {} exists", webhook.id)));
            }
            webhooks.insert(webhook.id, webhook.clone());
            Ok(())
        }

        async fn find_webhook(&self, id: WebhookId) -> Result<Option<Webhook>> {
            Ok(self.webhooks.read().await.get(&id).cloned())
        }

        async fn find_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Webhook>> {
            let mut owned: Vec<Webhook> = self
                .webhooks
                .read()
                .await
                .values()
                .filter(|webhook| webhook.owner_id == owner_id)
                .cloned()
                .collect();
            owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(owned)
        }

        async fn find_subscribed(&self, owner_id: OwnerId, event: WebhookEventKind) -> Result<Vec<Webhook>> {
            let mut subscribed: Vec<Webhook> = self
                .webhooks
                .read()
                .await
                .values()
                .filter(|webhook| webhook.owner_id == owner_id && webhook.receives(event))
                .cloned()
                .collect();
            subscribed.sort_by_key(|webhook| webhook.created_at);
            Ok(subscribed)
        }

        async fn update_webhook(
            &self,
            id: WebhookId,
            owner_id: OwnerId,
            changes: &WebhookChanges,
            updated_at: DateTime<Utc>,
        ) -> Result<Option<Webhook>> {
            let mut webhooks = self.webhooks.write().await;
            let Some(stored) = webhooks.get_mut(&id).filter(|stored| stored.owner_id == owner_id) else {
                return Ok(None);
            };

            if let Some(url) = &changes.url {
                stored.url.clone_from(url);
            }
            if let Some(events) = &changes.events {
                stored.events.clone_from(events);
            }
            if let Some(active) = changes.active {
                if active && !stored.active {
                    stored.failure_count = 0;
                }
                stored.active = active;
            }
            stored.updated_at = updated_at;

            Ok(Some(stored.clone()))
        }

        async fn delete_webhook(&self, id: WebhookId, owner_id: OwnerId) -> Result<bool> {
            let mut webhooks = self.webhooks.write().await;
            match webhooks.get(&id) {
                Some(stored) if stored.owner_id == owner_id => {
                    webhooks.remove(&id);
                    Ok(true)
                },
                _ => Ok(false),
            }
        }

        async fn record_success(&self, id: WebhookId, delivered_at: DateTime<Utc>) -> Result<()> {
            if let Some(webhook) = self.webhooks.write().await.get_mut(&id) {
                webhook.failure_count = 0;
                webhook.last_triggered_at = Some(delivered_at);
                webhook.updated_at = delivered_at;
            }
            Ok(())
        }

        async fn record_failure(
            &self,
            id: WebhookId,
            disable_threshold: u32,
            failed_at: DateTime<Utc>,
        ) -> Result<FailureTally> {
            let mut webhooks = self.webhooks.write().await;
            let webhook =
                webhooks.get_mut(&id).ok_or_else(|| CoreError::not_found(format!("webhook {id}")))?;

            webhook.failure_count = webhook.failure_count.saturating_add(1);
            if webhook.failure_count >= disable_threshold {
                webhook.active = false;
            }
            webhook.updated_at = failed_at;

            Ok(FailureTally { failure_count: webhook.failure_count, active: webhook.active })
        }

        async fn insert_delivery(&self, record: &DeliveryRecord) -> Result<()> {
            self.deliveries.write().await.insert(record.id, record.clone());
            Ok(())
        }

        async fn update_delivery(&self, record: &DeliveryRecord) -> Result<bool> {
            let mut deliveries = self.deliveries.write().await;
            match deliveries.get_mut(&record.id) {
                Some(stored) if !stored.status.is_terminal() => {
                    *stored = record.clone();
                    Ok(true)
                },
                _ => Ok(false),
            }
        }

        async fn find_delivery(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
            Ok(self.deliveries.read().await.get(&id).cloned())
        }

        async fn record_attempt(&self, attempt: &DeliveryAttemptLog) -> Result<()> {
            self.attempts.write().await.push(attempt.clone());
            Ok(())
        }

        async fn find_attempts(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttemptLog>> {
            let mut attempts: Vec<DeliveryAttemptLog> = self
                .attempts
                .read()
                .await
                .iter()
                .filter(|attempt| attempt.delivery_id == delivery_id)
                .cloned()
                .collect();
            attempts.sort_by_key(|attempt| attempt.attempt_number);
            Ok(attempts)
        }
    }
}

#[cfg(test)]
mod tests {
    use baatcheet_core::DeliveryStatus;

    use super::{memory::InMemoryWebhookStore, *};

    fn webhook(owner_id: OwnerId, events: Vec<WebhookEventKind>) -> Webhook {
        let now = Utc::now();
        Webhook {
            id: WebhookId::new(),
            owner_id,
            url: "https://receiver.example/hook".to_string(),
            events,
            secret: "ab".repeat(32),
            active: true,
            failure_count: 0,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn failure_tally_disables_at_threshold() {
        let store = InMemoryWebhookStore::new();
        let hook = webhook(OwnerId::new(), vec![WebhookEventKind::MessageCreated]);
        store.insert_webhook(&hook).await.unwrap();

        let now = Utc::now();
        let second = store.record_failure(hook.id, 2, now).await.unwrap();
        assert_eq!(second, FailureTally { failure_count: 1, active: true });

        let third = store.record_failure(hook.id, 2, now).await.unwrap();
        assert_eq!(third, FailureTally { failure_count: 2, active: false });
    }

    #[tokio::test]
    async fn success_resets_failures() {
        let store = InMemoryWebhookStore::new();
        let hook = webhook(OwnerId::new(), vec![WebhookEventKind::MessageCreated]);
        store.insert_webhook(&hook).await.unwrap();

        store.record_failure(hook.id, 10, Utc::now()).await.unwrap();
        let delivered_at = Utc::now();
        store.record_success(hook.id, delivered_at).await.unwrap();

        let stored = store.find_webhook(hook.id).await.unwrap().unwrap();
        assert_eq!(stored.failure_count, 0);
        assert_eq!(stored.last_triggered_at, Some(delivered_at));
    }

    #[tokio::test]
    async fn terminal_delivery_records_are_frozen() {
        let store = InMemoryWebhookStore::new();
        let mut record = DeliveryRecord::pending(WebhookId::new(), "message.created", b"{}".to_vec(), Utc::now());
        store.insert_delivery(&record).await.unwrap();

        record.status = DeliveryStatus::Success;
        record.attempts = 1;
        assert!(store.update_delivery(&record).await.unwrap());

        record.status = DeliveryStatus::Failed;
        assert!(!store.update_delivery(&record).await.unwrap());
        let stored = store.find_delivery(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn subscription_lookup_respects_owner_event_and_active() {
        let store = InMemoryWebhookStore::new();
        let owner = OwnerId::new();

        let matching = webhook(owner, vec![WebhookEventKind::ExportCompleted]);
        let other_event = webhook(owner, vec![WebhookEventKind::MessageCreated]);
        let other_owner = webhook(OwnerId::new(), vec![WebhookEventKind::ExportCompleted]);
        let mut inactive = webhook(owner, vec![WebhookEventKind::ExportCompleted]);
        inactive.active = false;

        for hook in [&matching, &other_event, &other_owner, &inactive] {
            store.insert_webhook(hook).await.unwrap();
        }

        let found = store.find_subscribed(owner, WebhookEventKind::ExportCompleted).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, matching.id);
    }

    #[tokio::test]
    async fn edit_without_active_flag_keeps_breaker_state() {
        let store = InMemoryWebhookStore::new();
        let hook = webhook(OwnerId::new(), vec![WebhookEventKind::MessageCreated]);
        store.insert_webhook(&hook).await.unwrap();
        store.record_failure(hook.id, 1, Utc::now()).await.unwrap();

        let changes = WebhookChanges { url: Some("https://moved.example/hook".to_string()), ..Default::default() };
        let stored = store.update_webhook(hook.id, hook.owner_id, &changes, Utc::now()).await.unwrap().unwrap();

        assert_eq!(stored.url, "https://moved.example/hook");
        assert!(!stored.active);
        assert_eq!(stored.failure_count, 1);
    }

    #[tokio::test]
    async fn switching_on_clears_failures_only_when_inactive() {
        let store = InMemoryWebhookStore::new();
        let hook = webhook(OwnerId::new(), vec![WebhookEventKind::MessageCreated]);
        store.insert_webhook(&hook).await.unwrap();
        store.record_failure(hook.id, 10, Utc::now()).await.unwrap();

        let enable = WebhookChanges { active: Some(true), ..Default::default() };
        let stored = store.update_webhook(hook.id, hook.owner_id, &enable, Utc::now()).await.unwrap().unwrap();
        assert_eq!(stored.failure_count, 1);

        store.record_failure(hook.id, 2, Utc::now()).await.unwrap();
        let stored = store.update_webhook(hook.id, hook.owner_id, &enable, Utc::now()).await.unwrap().unwrap();
        assert!(stored.active);
        assert_eq!(stored.failure_count, 0);

        assert!(store.update_webhook(hook.id, OwnerId::new(), &enable, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_requires_ownership() {
        let store = InMemoryWebhookStore::new();
        let hook = webhook(OwnerId::new(), vec![WebhookEventKind::MessageCreated]);
        store.insert_webhook(&hook).await.unwrap();

        assert!(!store.delete_webhook(hook.id, OwnerId::new()).await.unwrap());
        assert!(store.delete_webhook(hook.id, hook.owner_id).await.unwrap());
        assert!(!store.delete_webhook(hook.id, hook.owner_id).await.unwrap());
    }
}
