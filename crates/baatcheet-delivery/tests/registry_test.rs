//! Integration tests for webhook registration management.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use baatcheet_core::{
    error::Result as CoreResult,
    storage::webhooks::{FailureTally, WebhookChanges},
    DeliveryAttemptLog, DeliveryId, DeliveryRecord, OwnerId, TestClock, Webhook, WebhookEventKind,
    WebhookId,
};
use baatcheet_delivery::{
    storage::{memory::InMemoryWebhookStore, WebhookStore},
    RegistryError, WebhookRegistry, WebhookUpdate,
};
use chrono::{DateTime, Utc};

fn registry() -> (WebhookRegistry, Arc<InMemoryWebhookStore>, TestClock) {
    let store = Arc::new(InMemoryWebhookStore::new());
    let clock = TestClock::new();
    (WebhookRegistry::new(store.clone(), Arc::new(clock.clone())), store, clock)
}

#[tokio::test]
async fn register_returns_secret_once() {
    let (registry, _, _) = registry();
    let owner = OwnerId::new();

    let webhook = registry
        .register(owner, "https://hooks.example.com/baatcheet", &["message.created", "export.completed"])
        .await
        .unwrap();

    assert_eq!(webhook.secret.len(), 64);
    assert!(webhook.active);
    assert_eq!(webhook.failure_count, 0);
    assert_eq!(webhook.events, vec![WebhookEventKind::MessageCreated, WebhookEventKind::ExportCompleted]);

    let view = registry.get(webhook.id, owner).await.unwrap().unwrap();
    assert_ne!(view.secret, webhook.secret);
    assert!(view.secret.ends_with(&webhook.secret[60..]));
    assert!(view.secret.starts_with('*'));
}

#[tokio::test]
async fn invalid_registrations_are_not_persisted() {
    let (registry, store, _) = registry();
    let owner = OwnerId::new();

    let result = registry.register(owner, "ftp://files.example.com", &["message.created"]).await;
    assert!(matches!(result, Err(RegistryError::InvalidUrl { .. })));

    let result = registry.register(owner, "https://example.com", &["message.deleted"]).await;
    assert!(matches!(result, Err(RegistryError::UnknownEvent { .. })));

    let result = registry.register::<&str>(owner, "https://example.com", &[]).await;
    assert!(matches!(result, Err(RegistryError::NoEvents)));

    assert!(store.find_by_owner(owner).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_is_scoped_to_owner_newest_first() {
    let (registry, _, clock) = registry();
    let owner = OwnerId::new();

    let first = registry.register(owner, "https://a.example.com", &["message.created"]).await.unwrap();
    clock.advance(Duration::from_secs(1));
    let second = registry.register(owner, "https://b.example.com", &["message.created"]).await.unwrap();
    registry.register(OwnerId::new(), "https://c.example.com", &["message.created"]).await.unwrap();

    let listed = registry.list(owner).await.unwrap();
    let ids: Vec<WebhookId> = listed.iter().map(|view| view.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);
    assert!(listed.iter().all(|view| view.secret != first.secret && view.secret != second.secret));
}

#[tokio::test]
async fn other_owners_cannot_read_update_or_remove() {
    let (registry, store, _) = registry();
    let owner = OwnerId::new();
    let intruder = OwnerId::new();

    let webhook = registry.register(owner, "https://example.com/hook", &["message.created"]).await.unwrap();

    assert!(registry.get(webhook.id, intruder).await.unwrap().is_none());

    let result = registry
        .update(webhook.id, intruder, WebhookUpdate { active: Some(false), ..WebhookUpdate::default() })
        .await;
    assert!(matches!(result, Err(RegistryError::NotFound { .. })));

    assert!(!registry.remove(webhook.id, intruder).await.unwrap());
    assert!(store.find_webhook(webhook.id).await.unwrap().unwrap().active);
}

#[tokio::test]
async fn partial_update_revalidates_changed_fields() {
    let (registry, store, clock) = registry();
    let owner = OwnerId::new();
    let webhook = registry.register(owner, "https://example.com/hook", &["message.created"]).await.unwrap();

    let result = registry
        .update(
            webhook.id,
            owner,
            WebhookUpdate { url: Some("javascript:alert(1)".to_string()), ..WebhookUpdate::default() },
        )
        .await;
    assert!(matches!(result, Err(RegistryError::InvalidUrl { .. })));
    assert_eq!(store.find_webhook(webhook.id).await.unwrap().unwrap().url, "https://example.com/hook");

    clock.advance(Duration::from_secs(30));
    let view = registry
        .update(
            webhook.id,
            owner,
            WebhookUpdate {
                events: Some(vec!["audio.transcribed".to_string(), "image.analyzed".to_string()]),
                ..WebhookUpdate::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(view.url, "https://example.com/hook");
    assert_eq!(view.events, vec![WebhookEventKind::AudioTranscribed, WebhookEventKind::ImageAnalyzed]);
    assert!(view.updated_at > webhook.updated_at);
}

#[tokio::test]
async fn re_enabling_resets_failure_count() {
    let (registry, store, clock) = registry();
    let owner = OwnerId::new();
    let webhook = registry.register(owner, "https://example.com/hook", &["message.created"]).await.unwrap();

    for _ in 0..10 {
        store.record_failure(webhook.id, 10, baatcheet_core::Clock::now_utc(&clock)).await.unwrap();
    }
    let disabled = registry.get(webhook.id, owner).await.unwrap().unwrap();
    assert!(!disabled.active);
    assert_eq!(disabled.failure_count, 10);

    let enabled = registry
        .update(webhook.id, owner, WebhookUpdate { active: Some(true), ..WebhookUpdate::default() })
        .await
        .unwrap();
    assert!(enabled.active);
    assert_eq!(enabled.failure_count, 0);
}

#[tokio::test]
async fn deactivating_keeps_failure_count() {
    let (registry, store, clock) = registry();
    let owner = OwnerId::new();
    let webhook = registry.register(owner, "https://example.com/hook", &["message.created"]).await.unwrap();

    store.record_failure(webhook.id, 10, baatcheet_core::Clock::now_utc(&clock)).await.unwrap();
    let view = registry
        .update(webhook.id, owner, WebhookUpdate { active: Some(false), ..WebhookUpdate::default() })
        .await
        .unwrap();

    assert!(!view.active);
    assert_eq!(view.failure_count, 1);
}

#[tokio::test]
async fn remove_is_idempotent() {
    let (registry, _, _) = registry();
    let owner = OwnerId::new();
    let webhook = registry.register(owner, "https://example.com/hook", &["message.created"]).await.unwrap();

    assert!(registry.remove(webhook.id, owner).await.unwrap());
    assert!(!registry.remove(webhook.id, owner).await.unwrap());
    assert!(!registry.remove(WebhookId::new(), owner).await.unwrap());
    assert!(registry.get(webhook.id, owner).await.unwrap().is_none());
}

/// Store where a delivery's terminal failure lands just before every owner
/// edit is applied.
struct FailureBeforeEdit {
    inner: InMemoryWebhookStore,
}

#[async_trait]
impl WebhookStore for FailureBeforeEdit {
    async fn insert_webhook(&self, webhook: &Webhook) -> CoreResult<()> {
        self.inner.insert_webhook(webhook).await
    }

    async fn find_webhook(&self, id: WebhookId) -> CoreResult<Option<Webhook>> {
        self.inner.find_webhook(id).await
    }

    async fn find_by_owner(&self, owner_id: OwnerId) -> CoreResult<Vec<Webhook>> {
        self.inner.find_by_owner(owner_id).await
    }

    async fn find_subscribed(&self, owner_id: OwnerId, event: WebhookEventKind) -> CoreResult<Vec<Webhook>> {
        self.inner.find_subscribed(owner_id, event).await
    }

    async fn update_webhook(
        &self,
        id: WebhookId,
        owner_id: OwnerId,
        changes: &WebhookChanges,
        updated_at: DateTime<Utc>,
    ) -> CoreResult<Option<Webhook>> {
        self.inner.record_failure(id, 1, updated_at).await?;
        self.inner.update_webhook(id, owner_id, changes, updated_at).await
    }

    async fn delete_webhook(&self, id: WebhookId, owner_id: OwnerId) -> CoreResult<bool> {
        self.inner.delete_webhook(id, owner_id).await
    }

    async fn record_success(&self, id: WebhookId, delivered_at: DateTime<Utc>) -> CoreResult<()> {
        self.inner.record_success(id, delivered_at).await
    }

    async fn record_failure(
        &self,
        id: WebhookId,
        disable_threshold: u32,
        failed_at: DateTime<Utc>,
    ) -> CoreResult<FailureTally> {
        self.inner.record_failure(id, disable_threshold, failed_at).await
    }

    async fn insert_delivery(&self, record: &DeliveryRecord) -> CoreResult<()> {
        self.inner.insert_delivery(record).await
    }

    async fn update_delivery(&self, record: &DeliveryRecord) -> CoreResult<bool> {
        self.inner.update_delivery(record).await
    }

    async fn find_delivery(&self, id: DeliveryId) -> CoreResult<Option<DeliveryRecord>> {
        self.inner.find_delivery(id).await
    }

    async fn record_attempt(&self, attempt: &DeliveryAttemptLog) -> CoreResult<()> {
        self.inner.record_attempt(attempt).await
    }

    async fn find_attempts(&self, delivery_id: DeliveryId) -> CoreResult<Vec<DeliveryAttemptLog>> {
        self.inner.find_attempts(delivery_id).await
    }
}

#[tokio::test]
async fn url_edit_does_not_undo_concurrent_disablement() {
    let store = Arc::new(FailureBeforeEdit { inner: InMemoryWebhookStore::new() });
    let registry = WebhookRegistry::new(store.clone(), Arc::new(TestClock::new()));
    let owner = OwnerId::new();
    let webhook = registry.register(owner, "https://example.com/hook", &["message.created"]).await.unwrap();

    let view = registry
        .update(
            webhook.id,
            owner,
            WebhookUpdate { url: Some("https://example.com/moved".to_string()), ..WebhookUpdate::default() },
        )
        .await
        .unwrap();

    assert_eq!(view.url, "https://example.com/moved");
    assert!(!view.active);
    assert_eq!(view.failure_count, 1);

    let stored = store.find_webhook(webhook.id).await.unwrap().unwrap();
    assert!(!stored.active);
    assert_eq!(stored.failure_count, 1);
}
