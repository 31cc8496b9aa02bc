//! Webhook registrations owned by users.
//!
//! Validation happens here, before anything is persisted. The signing
//! secret is returned exactly once, from [`WebhookRegistry::register`];
//! every other read goes through the masked [`WebhookView`].

use std::sync::Arc;

use baatcheet_core::{
    storage::webhooks::WebhookChanges, Clock, CoreError, OwnerId, Webhook, WebhookEventKind, WebhookId,
    WebhookView,
};
use rand::RngCore;
use reqwest::Url;
use thiserror::Error;
use tracing::{info, warn};

use crate::storage::WebhookStore;

/// Bytes of entropy in a generated signing secret.
pub const SECRET_BYTES: usize = 32;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors returned synchronously by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// URL is malformed or not `http`/`https`.
    #[error("invalid webhook url '{url}': {reason}")]
    InvalidUrl {
        /// Rejected URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Event name outside the subscribable vocabulary.
    #[error("unknown webhook event '{event}'")]
    UnknownEvent {
        /// Rejected event name
        event: String,
    },

    /// A registration must subscribe to at least one event.
    #[error("at least one event is required")]
    NoEvents,

    /// Registration does not exist or belongs to another owner.
    #[error("webhook {id} not found")]
    NotFound {
        /// Requested registration
        id: WebhookId,
    },

    /// Durable store failure.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

impl RegistryError {
    fn invalid_url(url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.to_string(), reason: reason.into() }
    }
}

/// Partial update of a registration. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct WebhookUpdate {
    /// New target URL.
    pub url: Option<String>,
    /// New event subscription.
    pub events: Option<Vec<String>>,
    /// Enable or disable delivery.
    pub active: Option<bool>,
}

/// Creates, updates, and looks up webhook registrations.
pub struct WebhookRegistry {
    store: Arc<dyn WebhookStore>,
    clock: Arc<dyn Clock>,
}

impl WebhookRegistry {
    /// Creates a registry backed by `store`.
    pub fn new(store: Arc<dyn WebhookStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Registers a new webhook and returns it with its secret visible.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl`, `UnknownEvent`, or `NoEvents` for bad input and
    /// `Storage` if the insert fails.
    pub async fn register<S: AsRef<str>>(&self, owner_id: OwnerId, url: &str, events: &[S]) -> Result<Webhook> {
        let url = validate_url(url)?;
        let events = parse_events(events)?;
        let now = self.clock.now_utc();

        let webhook = Webhook {
            id: WebhookId::new(),
            owner_id,
            url,
            events,
            secret: generate_secret(),
            active: true,
            failure_count: 0,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_webhook(&webhook).await?;

        info!(
            webhook_id = %webhook.id,
            owner_id = %owner_id,
            events = webhook.events.len(),
            "webhook registered"
        );

        Ok(webhook)
    }

    /// Applies a partial update to an owned registration.
    ///
    /// Re-enabling an inactive registration resets its failure count.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the registration does not exist or is owned by
    /// someone else, and validation errors for a changed URL or event list.
    pub async fn update(&self, id: WebhookId, owner_id: OwnerId, update: WebhookUpdate) -> Result<WebhookView> {
        let changes = WebhookChanges {
            url: update.url.as_deref().map(validate_url).transpose()?,
            events: update.events.as_deref().map(parse_events::<String>).transpose()?,
            active: update.active,
        };

        let webhook = self
            .store
            .update_webhook(id, owner_id, &changes, self.clock.now_utc())
            .await?
            .ok_or(RegistryError::NotFound { id })?;

        info!(webhook_id = %id, active = webhook.active, "webhook updated");
        Ok(webhook.view())
    }

    /// Deletes an owned registration. Missing or foreign ids return `false`.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the delete fails.
    pub async fn remove(&self, id: WebhookId, owner_id: OwnerId) -> Result<bool> {
        let removed = self.store.delete_webhook(id, owner_id).await?;
        if removed {
            info!(webhook_id = %id, "webhook removed");
        }
        Ok(removed)
    }

    /// Masked view of an owned registration.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the lookup fails.
    pub async fn get(&self, id: WebhookId, owner_id: OwnerId) -> Result<Option<WebhookView>> {
        Ok(self.find_owned(id, owner_id).await?.map(|webhook| webhook.view()))
    }

    /// Masked views of every registration of an owner, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the lookup fails.
    pub async fn list(&self, owner_id: OwnerId) -> Result<Vec<WebhookView>> {
        let webhooks = self.store.find_by_owner(owner_id).await?;
        Ok(webhooks.iter().map(Webhook::view).collect())
    }

    /// Active registrations of `owner_id` subscribed to `event`.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the lookup fails.
    pub async fn find_subscribed(&self, owner_id: OwnerId, event: WebhookEventKind) -> Result<Vec<Webhook>> {
        Ok(self.store.find_subscribed(owner_id, event).await?)
    }

    pub(crate) async fn find_owned(&self, id: WebhookId, owner_id: OwnerId) -> Result<Option<Webhook>> {
        let webhook = self.store.find_webhook(id).await?;
        Ok(webhook.filter(|webhook| webhook.owner_id == owner_id))
    }
}

fn validate_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let url = Url::parse(trimmed).map_err(|e| RegistryError::invalid_url(raw, e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {},
        other => return Err(RegistryError::invalid_url(raw, format!("unsupported scheme '{other}'"))),
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => {},
        _ => return Err(RegistryError::invalid_url(raw, "missing host")),
    }

    Ok(trimmed.to_string())
}

fn parse_events<S: AsRef<str>>(names: &[S]) -> Result<Vec<WebhookEventKind>> {
    let mut events = Vec::with_capacity(names.len());
    for name in names {
        let name = name.as_ref();
        let event = name
            .parse::<WebhookEventKind>()
            .map_err(|_| RegistryError::UnknownEvent { event: name.to_string() })?;
        if !events.contains(&event) {
            events.push(event);
        }
    }

    if events.is_empty() {
        warn!("webhook registration without events rejected");
        return Err(RegistryError::NoEvents);
    }
    Ok(events)
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation() {
        assert!(validate_url("https://example.com/hook").is_ok());
        assert!(validate_url("http://localhost:8080/hook").is_ok());
        assert_eq!(validate_url("  https://example.com  ").unwrap(), "https://example.com");

        assert!(matches!(validate_url("ftp://example.com"), Err(RegistryError::InvalidUrl { .. })));
        assert!(matches!(validate_url("not a url"), Err(RegistryError::InvalidUrl { .. })));
        assert!(matches!(validate_url("mailto:ops@example.com"), Err(RegistryError::InvalidUrl { .. })));
    }

    #[test]
    fn events_are_validated_and_deduplicated() {
        let events = parse_events(&["message.created", "export.completed", "message.created"]).unwrap();
        assert_eq!(events, vec![WebhookEventKind::MessageCreated, WebhookEventKind::ExportCompleted]);

        assert!(matches!(
            parse_events(&["message.created", "message.deleted"]),
            Err(RegistryError::UnknownEvent { event }) if event == "message.deleted"
        ));
        assert!(matches!(parse_events::<&str>(&[]), Err(RegistryError::NoEvents)));
        assert!(matches!(
            parse_events(&[baatcheet_core::TEST_EVENT]),
            Err(RegistryError::UnknownEvent { .. })
        ));
    }

    #[test]
    fn secrets_are_256_bit_hex_and_unique() {
        let first = generate_secret();
        let second = generate_secret();

        assert_eq!(first.len(), SECRET_BYTES * 2);
        assert!(first.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }
}
