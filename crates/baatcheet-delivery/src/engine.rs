//! Webhook delivery engine.
//!
//! Each triggered event becomes one [`DeliveryRecord`] per registration. The
//! first attempt runs inline so the caller learns its outcome; retries run on
//! a detached task that sleeps on the injected [`Clock`] until the record's
//! `next_retry_at`.
//!
//! ```text
//!   pending ──2xx──▶ success
//!      │
//!      └─failure─▶ pending (retry at +1s, +5s, ...) ──exhausted──▶ failed
//!                                                                    │
//!                                    registration failure_count += 1 ◀┘
//! ```
//!
//! Store failures are logged and never change the outcome of an attempt.

use std::{sync::Arc, time::Instant};

use baatcheet_core::{
    Clock, DeliveryAttemptLog, DeliveryId, DeliveryRecord, DeliveryStatus, Webhook, WebhookId,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{DeliveryResponse, WebhookClient, WebhookRequest},
    error::{DeliveryError, Result},
    retry::{RetryDecision, RetrySchedule},
    signing::signature_header,
    storage::WebhookStore,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Attempt budget and backoff between attempts.
    pub schedule: RetrySchedule,
    /// Terminal failures after which a registration is deactivated.
    pub disable_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { schedule: RetrySchedule::default(), disable_threshold: crate::DEFAULT_DISABLE_THRESHOLD }
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Delivery records created.
    pub deliveries_started: u64,
    /// HTTP attempts made, first attempts and retries.
    pub attempts_made: u64,
    /// Deliveries that ended with a 2xx.
    pub successful_deliveries: u64,
    /// Retries scheduled after a failed attempt.
    pub retries_scheduled: u64,
    /// Deliveries that exhausted their attempts.
    pub permanent_failures: u64,
    /// Registrations deactivated by the failure threshold.
    pub webhooks_disabled: u64,
}

/// Result of one attempt, or of a delivery once it settles.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// Receiver answered 2xx.
    Delivered {
        /// Response status
        status_code: u16,
    },
    /// Attempt failed; another one is due.
    RetryScheduled {
        /// When the next attempt runs
        next_retry_at: DateTime<Utc>,
        /// Why this attempt failed
        error: DeliveryError,
    },
    /// Attempt budget exhausted; the delivery is `failed`.
    Failed {
        /// Error of the last attempt
        error: DeliveryError,
    },
}

impl AttemptOutcome {
    /// Whether the delivery reached the receiver.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Whether no further attempt will follow.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::RetryScheduled { .. })
    }
}

/// Handle to one delivery started by [`DeliveryEngine::deliver`].
#[derive(Debug)]
pub struct DeliveryTicket {
    /// Delivery record id.
    pub delivery_id: DeliveryId,
    /// Target registration.
    pub webhook_id: WebhookId,
    /// Outcome of the inline first attempt.
    pub first_attempt: AttemptOutcome,
    retry: Option<JoinHandle<AttemptOutcome>>,
}

impl DeliveryTicket {
    /// Waits for retries to finish and returns the final outcome.
    ///
    /// Returns `RetryScheduled` if the engine was shut down before the
    /// delivery settled.
    pub async fn wait(self) -> AttemptOutcome {
        match self.retry {
            None => self.first_attempt,
            Some(handle) => match handle.await {
                Ok(outcome) => outcome,
                Err(e) => AttemptOutcome::Failed { error: DeliveryError::internal(format!("retry task failed: {e}")) },
            },
        }
    }
}

/// Signs, sends, retries, and records webhook deliveries.
///
/// Cheap to clone; clones share the store, client, and counters.
#[derive(Clone)]
pub struct DeliveryEngine {
    store: Arc<dyn WebhookStore>,
    client: WebhookClient,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
}

impl DeliveryEngine {
    /// Creates an engine. Retry tasks run until `cancellation_token` fires.
    pub fn new(
        store: Arc<dyn WebhookStore>,
        client: WebhookClient,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            client,
            clock,
            config: Arc::new(config),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Starts delivery of `event` to `webhook`.
    ///
    /// Creates a pending record, runs the first attempt inline, and spawns
    /// the retry task if that attempt failed. Retries use the registration as
    /// passed here, so later edits to it do not affect this delivery.
    ///
    /// # Errors
    ///
    /// Returns `InternalError` if the envelope cannot be serialized. HTTP
    /// failures are reported through the ticket, not as errors.
    pub async fn deliver(&self, webhook: &Webhook, event: &str, data: &serde_json::Value) -> Result<DeliveryTicket> {
        let now = self.clock.now_utc();
        let payload = envelope(event, now, data)?;
        let mut record = DeliveryRecord::pending(webhook.id, event, payload, now);

        if let Err(e) = self.store.insert_delivery(&record).await {
            error!(delivery_id = %record.id, error = %e, "failed to persist delivery record");
        }
        self.stats.write().await.deliveries_started += 1;

        debug!(delivery_id = %record.id, webhook_id = %webhook.id, event, "delivery started");

        let first_attempt = self.attempt(webhook, &mut record).await;
        let delivery_id = record.id;

        let retry = if first_attempt.is_settled() {
            None
        } else {
            let engine = self.clone();
            let webhook = webhook.clone();
            let pending = first_attempt.clone();
            Some(tokio::spawn(async move { engine.run_retries(webhook, record, pending).await }))
        };

        Ok(DeliveryTicket { delivery_id, webhook_id: webhook.id, first_attempt, retry })
    }

    /// Single signed POST with no record, retry, or failure bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `NetworkError` when no response arrives. Non-2xx
    /// responses are returned as `Ok`.
    pub async fn send_once(&self, webhook: &Webhook, event: &str, data: &serde_json::Value) -> Result<DeliveryResponse> {
        let payload = envelope(event, self.clock.now_utc(), data)?;
        self.send_signed(webhook, DeliveryId::new(), event, &payload, 1).await
    }

    async fn run_retries(&self, webhook: Webhook, mut record: DeliveryRecord, mut outcome: AttemptOutcome) -> AttemptOutcome {
        while let AttemptOutcome::RetryScheduled { next_retry_at, .. } = &outcome {
            let wait = (*next_retry_at - self.clock.now_utc()).to_std().unwrap_or_default();

            tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => {
                    info!(delivery_id = %record.id, attempts = record.attempts, "retry abandoned on shutdown");
                    return outcome;
                },
                () = self.clock.sleep(wait) => {},
            }

            outcome = self.attempt(&webhook, &mut record).await;
        }
        outcome
    }

    async fn attempt(&self, webhook: &Webhook, record: &mut DeliveryRecord) -> AttemptOutcome {
        let attempt_number = record.attempts + 1;
        let attempted_at = self.clock.now_utc();
        let started = Instant::now();

        let result = self.send_signed(webhook, record.id, &record.event, &record.payload, attempt_number).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (status_code, failure) = match result {
            Ok(response) => (Some(response.status_code), response.error_for_status().err()),
            Err(error) => (None, Some(error)),
        };
        let attempt_error = failure.as_ref().map(ToString::to_string);

        let now = self.clock.now_utc();
        record.attempts = attempt_number;
        record.last_status_code = status_code.or(record.last_status_code);

        let outcome = match failure {
            None => {
                record.status = DeliveryStatus::Success;
                record.next_retry_at = None;
                record.last_error = None;
                record.completed_at = Some(now);
                AttemptOutcome::Delivered { status_code: status_code.unwrap_or_default() }
            },
            Some(error) => {
                record.last_error = Some(error.to_string());
                let decision = if error.is_retryable() {
                    self.config.schedule.decide(attempt_number, now)
                } else {
                    RetryDecision::GiveUp { reason: error.to_string() }
                };

                match decision {
                    RetryDecision::Retry { next_attempt_at } => {
                        record.next_retry_at = Some(next_attempt_at);
                        AttemptOutcome::RetryScheduled { next_retry_at: next_attempt_at, error }
                    },
                    RetryDecision::GiveUp { reason } => {
                        debug!(delivery_id = %record.id, reason, "no retries left");
                        record.status = DeliveryStatus::Failed;
                        record.next_retry_at = None;
                        record.completed_at = Some(now);
                        AttemptOutcome::Failed { error }
                    },
                }
            },
        };

        let log = DeliveryAttemptLog {
            delivery_id: record.id,
            attempt_number,
            status_code,
            error: attempt_error,
            attempted_at,
            duration_ms,
            next_retry_at: record.next_retry_at,
        };
        self.persist_attempt(record, &log).await;
        self.settle(webhook, record, &outcome, now).await;
        outcome
    }

    async fn persist_attempt(&self, record: &DeliveryRecord, log: &DeliveryAttemptLog) {
        match self.store.update_delivery(record).await {
            Ok(true) => {},
            Ok(false) => warn!(delivery_id = %record.id, "delivery record missing or already terminal"),
            Err(e) => error!(delivery_id = %record.id, error = %e, "failed to update delivery record"),
        }

        if let Err(e) = self.store.record_attempt(log).await {
            error!(delivery_id = %record.id, error = %e, "failed to record delivery attempt");
        }
    }

    async fn settle(&self, webhook: &Webhook, record: &DeliveryRecord, outcome: &AttemptOutcome, now: DateTime<Utc>) {
        let mut stats = self.stats.write().await;
        stats.attempts_made += 1;

        match outcome {
            AttemptOutcome::Delivered { status_code } => {
                stats.successful_deliveries += 1;
                drop(stats);

                info!(
                    delivery_id = %record.id,
                    webhook_id = %webhook.id,
                    status_code,
                    attempts = record.attempts,
                    "webhook delivered"
                );

                if let Err(e) = self.store.record_success(webhook.id, now).await {
                    error!(webhook_id = %webhook.id, error = %e, "failed to record webhook success");
                }
            },
            AttemptOutcome::RetryScheduled { next_retry_at, error } => {
                stats.retries_scheduled += 1;
                drop(stats);

                warn!(
                    delivery_id = %record.id,
                    webhook_id = %webhook.id,
                    attempt = record.attempts,
                    category = %error.category(),
                    error = %error,
                    next_retry_at = %next_retry_at,
                    "webhook attempt failed, retry scheduled"
                );
            },
            AttemptOutcome::Failed { error } => {
                stats.permanent_failures += 1;
                drop(stats);

                warn!(
                    delivery_id = %record.id,
                    webhook_id = %webhook.id,
                    attempts = record.attempts,
                    error = %error,
                    "webhook delivery failed permanently"
                );

                self.count_failure(webhook.id, now).await;
            },
        }
    }

    async fn count_failure(&self, webhook_id: WebhookId, now: DateTime<Utc>) {
        let threshold = self.config.disable_threshold;

        let tally = match self.store.record_failure(webhook_id, threshold, now).await {
            Ok(tally) => tally,
            Err(e) => {
                error!(webhook_id = %webhook_id, error = %e, "failed to record webhook failure");
                return;
            },
        };

        if !tally.active && tally.failure_count == threshold {
            self.stats.write().await.webhooks_disabled += 1;
            warn!(
                webhook_id = %webhook_id,
                failure_count = tally.failure_count,
                "webhook disabled after repeated delivery failures"
            );
        }
    }

    async fn send_signed(
        &self,
        webhook: &Webhook,
        delivery_id: DeliveryId,
        event: &str,
        payload: &[u8],
        attempt_number: u32,
    ) -> Result<DeliveryResponse> {
        let signature =
            signature_header(payload, &webhook.secret).map_err(|e| DeliveryError::configuration(e.to_string()))?;

        self.client
            .send(WebhookRequest {
                delivery_id,
                event: event.to_string(),
                url: webhook.url.clone(),
                body: Bytes::copy_from_slice(payload),
                signature,
                attempt_number,
            })
            .await
    }
}

/// Serializes the `{event, timestamp, data}` body sent to receivers.
fn envelope(event: &str, timestamp: DateTime<Utc>, data: &serde_json::Value) -> Result<Vec<u8>> {
    let body = serde_json::json!({
        "event": event,
        "timestamp": timestamp.to_rfc3339(),
        "data": data,
    });
    serde_json::to_vec(&body).map_err(|e| DeliveryError::internal(format!("failed to serialize payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_event_timestamp_and_data() {
        let timestamp = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc);
        let body = envelope("message.created", timestamp, &serde_json::json!({"id": 7})).unwrap();

        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["event"], "message.created");
        assert_eq!(parsed["timestamp"], "2026-03-01T12:00:00+00:00");
        assert_eq!(parsed["data"]["id"], 7);
    }

    #[test]
    fn outcome_predicates() {
        assert!(AttemptOutcome::Delivered { status_code: 200 }.is_settled());
        assert!(AttemptOutcome::Failed { error: DeliveryError::timeout(10) }.is_settled());
        assert!(!AttemptOutcome::RetryScheduled { next_retry_at: Utc::now(), error: DeliveryError::timeout(10) }
            .is_settled());
        assert!(AttemptOutcome::Delivered { status_code: 204 }.is_delivered());
    }
}
