//! Fan-out of application events to subscribed registrations.

use std::{sync::Arc, time::Instant};

use baatcheet_core::{OwnerId, WebhookEventKind, WebhookId, TEST_EVENT};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::{
    engine::{AttemptOutcome, DeliveryEngine, DeliveryTicket},
    error::{DeliveryError, Result},
    registry::{RegistryError, WebhookRegistry},
};

/// Registration whose delivery could not be started.
#[derive(Debug)]
pub struct DispatchFailure {
    /// Registration that was skipped.
    pub webhook_id: WebhookId,
    /// Why.
    pub error: DeliveryError,
}

/// Result of [`EventDispatcher::dispatch`].
///
/// Every ticket's first attempt has completed; retries may still be running.
#[derive(Debug)]
pub struct DispatchReport {
    /// Dispatched event.
    pub event: WebhookEventKind,
    /// One ticket per registration the delivery was started for.
    pub tickets: Vec<DeliveryTicket>,
    /// Registrations for which no delivery could be started.
    pub failures: Vec<DispatchFailure>,
}

impl DispatchReport {
    /// Number of registrations the event was handed to.
    pub fn targeted(&self) -> usize {
        self.tickets.len() + self.failures.len()
    }

    /// Registrations that accepted the first attempt.
    pub fn delivered_first_attempt(&self) -> usize {
        self.tickets.iter().filter(|ticket| ticket.first_attempt.is_delivered()).count()
    }

    /// Waits for every delivery to settle.
    pub async fn wait_all(self) -> Vec<(WebhookId, AttemptOutcome)> {
        let mut outcomes = Vec::with_capacity(self.tickets.len());
        for ticket in self.tickets {
            let webhook_id = ticket.webhook_id;
            outcomes.push((webhook_id, ticket.wait().await));
        }
        outcomes
    }
}

/// Outcome of a manual test delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestDeliveryResult {
    /// Receiver answered 2xx.
    pub success: bool,
    /// Response status, absent when no response arrived.
    pub status_code: Option<u16>,
    /// Failure description.
    pub error: Option<String>,
    /// Duration of the attempt.
    pub duration_ms: u64,
}

/// Looks up subscribers for an event and hands each to the engine.
pub struct EventDispatcher {
    registry: Arc<WebhookRegistry>,
    engine: DeliveryEngine,
}

impl EventDispatcher {
    /// Creates a dispatcher.
    pub fn new(registry: Arc<WebhookRegistry>, engine: DeliveryEngine) -> Self {
        Self { registry, engine }
    }

    /// Delivery engine used for dispatches.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Delivers `event` to every active registration of `owner_id` that
    /// subscribes to it.
    ///
    /// Deliveries run concurrently and a failure for one registration never
    /// affects the others. Returns once every first attempt has completed.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the subscriber lookup fails.
    pub async fn dispatch(
        &self,
        owner_id: OwnerId,
        event: WebhookEventKind,
        data: serde_json::Value,
    ) -> Result<DispatchReport> {
        let webhooks = self.registry.find_subscribed(owner_id, event).await.map_err(lookup_error)?;

        if webhooks.is_empty() {
            return Ok(DispatchReport { event, tickets: Vec::new(), failures: Vec::new() });
        }

        let data = Arc::new(data);
        let mut deliveries = JoinSet::new();
        for webhook in webhooks {
            let engine = self.engine.clone();
            let data = Arc::clone(&data);
            deliveries.spawn(async move {
                let result = engine.deliver(&webhook, event.as_str(), &data).await;
                (webhook.id, result)
            });
        }

        let mut tickets = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(ticket))) => tickets.push(ticket),
                Ok((webhook_id, Err(error))) => {
                    warn!(webhook_id = %webhook_id, error = %error, "failed to start webhook delivery");
                    failures.push(DispatchFailure { webhook_id, error });
                },
                Err(e) => error!(error = %e, "webhook delivery task panicked"),
            }
        }

        info!(
            owner_id = %owner_id,
            event = %event,
            targeted = tickets.len() + failures.len(),
            delivered = tickets.iter().filter(|ticket| ticket.first_attempt.is_delivered()).count(),
            "event dispatched"
        );

        Ok(DispatchReport { event, tickets, failures })
    }

    /// Sends a single `webhook.test` delivery to an owned registration.
    ///
    /// No record is kept, nothing is retried, and the failure count is left
    /// alone. Inactive registrations can be tested too.
    ///
    /// # Errors
    ///
    /// Returns `WebhookNotFound` if the registration does not exist or is
    /// owned by someone else, and `DatabaseError` if the lookup fails.
    pub async fn send_test(&self, id: WebhookId, owner_id: OwnerId) -> Result<TestDeliveryResult> {
        let webhook = self
            .registry
            .find_owned(id, owner_id)
            .await
            .map_err(lookup_error)?
            .ok_or_else(|| DeliveryError::webhook_not_found(id))?;

        let data = serde_json::json!({
            "message": "This is a test webhook from BaatCheet",
            "webhook_id": webhook.id,
        });

        let started = Instant::now();
        let result = self.engine.send_once(&webhook, TEST_EVENT, &data).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let report = match result {
            Ok(response) => TestDeliveryResult {
                success: response.is_success,
                status_code: Some(response.status_code),
                error: response.error_for_status().err().map(|e| e.to_string()),
                duration_ms,
            },
            Err(e) => TestDeliveryResult { success: false, status_code: None, error: Some(e.to_string()), duration_ms },
        };

        info!(webhook_id = %id, success = report.success, status_code = ?report.status_code, "test webhook sent");
        Ok(report)
    }
}

fn lookup_error(error: RegistryError) -> DeliveryError {
    match error {
        RegistryError::Storage(e) => DeliveryError::from(e),
        other => DeliveryError::internal(other.to_string()),
    }
}
