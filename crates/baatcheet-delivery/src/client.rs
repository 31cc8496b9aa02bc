//! HTTP client for outbound webhook POSTs.
//!
//! Builds the signed request, enforces the per-attempt timeout, and turns
//! transport failures into [`DeliveryError`]s. Any HTTP response, including
//! 4xx and 5xx, is returned as a [`DeliveryResponse`]; the engine decides
//! what a status means.

use std::time::{Duration, Instant};

use baatcheet_core::DeliveryId;
use bytes::Bytes;
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying `sha256=<hex>`.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
/// Header carrying the event name.
pub const EVENT_HEADER: &str = "X-Webhook-Event";
/// Header carrying the delivery id.
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";
/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

const MAX_AUDIT_BODY: usize = 1024;

/// Configuration for the webhook client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for one attempt, connect through body.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: "BaatCheet-Webhooks/1.0".to_string(),
        }
    }
}

/// One signed POST.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Delivery this attempt belongs to.
    pub delivery_id: DeliveryId,
    /// Event name.
    pub event: String,
    /// Destination URL.
    pub url: String,
    /// Exact body bytes the signature covers.
    pub body: Bytes,
    /// `sha256=<hex>` header value.
    pub signature: String,
    /// 1-based attempt number.
    pub attempt_number: u32,
}

/// Response to a delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated for audit.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

impl DeliveryResponse {
    /// `Ok` for 2xx, the matching [`DeliveryError`] otherwise.
    ///
    /// # Errors
    ///
    /// Returns `ClientError`, `ServerError`, or `UnexpectedStatus` for non-2xx
    /// responses.
    pub fn error_for_status(&self) -> Result<()> {
        if self.is_success {
            Ok(())
        } else {
            Err(DeliveryError::from_status(self.status_code, self.body.clone()))
        }
    }
}

/// HTTP client for webhook delivery.
///
/// Cheap to clone; the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl WebhookClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// POSTs a signed webhook.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when the attempt exceeds the configured timeout and
    /// `NetworkError` for any other transport failure.
    pub async fn send(&self, request: WebhookRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            event = %request.event,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            let start_time = Instant::now();

            let result = self
                .client
                .post(&request.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, &request.signature)
                .header(EVENT_HEADER, &request.event)
                .header(DELIVERY_HEADER, request.delivery_id.to_string())
                .header(ATTEMPT_HEADER, request.attempt_number.to_string())
                .body(request.body)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), error = %e, "webhook request failed");

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let delivery_response = read_response(response, start_time).await;

            match delivery_response.status_code {
                200..=299 => {
                    tracing::debug!(
                        status = delivery_response.status_code,
                        duration_ms = delivery_response.duration.as_millis(),
                        "webhook accepted"
                    );
                },
                status => {
                    tracing::warn!(status, body = %delivery_response.body, "webhook rejected");
                },
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }
}

async fn read_response(response: Response, start_time: Instant) -> DeliveryResponse {
    let status_code = response.status().as_u16();
    let is_success = response.status().is_success();

    let body = match response.bytes().await {
        Ok(bytes) => truncate_body(&bytes),
        Err(e) => {
            tracing::debug!(error = %e, "failed to read response body");
            String::new()
        },
    };

    DeliveryResponse { status_code, body, duration: start_time.elapsed(), is_success }
}

fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_AUDIT_BODY {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let suffix = "... (truncated)";
    let head = String::from_utf8_lossy(&bytes[..MAX_AUDIT_BODY - suffix.len()]);
    format!("{head}{suffix}")
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn create_test_request(url: String) -> WebhookRequest {
        WebhookRequest {
            delivery_id: DeliveryId::new(),
            event: "message.created".to_string(),
            url,
            body: Bytes::from_static(br#"{"event":"message.created"}"#),
            signature: "sha256=00".to_string(),
            attempt_number: 2,
        }
    }

    #[tokio::test]
    async fn successful_delivery() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&mock_server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let response = client.send(create_test_request(format!("{}/hook", mock_server.uri()))).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert!(response.is_success);
        assert_eq!(response.body, "OK");
        assert!(response.error_for_status().is_ok());
    }

    #[tokio::test]
    async fn delivery_headers_are_sent() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::header(SIGNATURE_HEADER, "sha256=00"))
            .and(matchers::header(EVENT_HEADER, "message.created"))
            .and(matchers::header(ATTEMPT_HEADER, "2"))
            .and(matchers::header_exists(DELIVERY_HEADER))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let response = client.send(create_test_request(mock_server.uri())).await.unwrap();

        assert_eq!(response.status_code, 204);
    }

    #[tokio::test]
    async fn error_statuses_are_responses_not_errors() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&mock_server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let response = client.send(create_test_request(mock_server.uri())).await.unwrap();

        assert!(!response.is_success);
        assert!(matches!(
            response.error_for_status(),
            Err(DeliveryError::ServerError { status_code: 503, .. })
        ));
    }

    #[tokio::test]
    async fn slow_receiver_times_out() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let client = WebhookClient::new(ClientConfig {
            timeout: Duration::from_millis(200),
            ..ClientConfig::default()
        })
        .unwrap();
        let result = client.send(create_test_request(mock_server.uri())).await;

        assert!(matches!(result, Err(DeliveryError::Timeout { .. })));
    }

    #[tokio::test]
    async fn unreachable_receiver_is_network_error() {
        let client = WebhookClient::with_defaults().unwrap();
        let result = client.send(create_test_request("http://127.0.0.1:1/hook".to_string())).await;

        assert!(matches!(result, Err(DeliveryError::NetworkError { .. })));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = vec![b'x'; 4096];
        let truncated = truncate_body(&body);

        assert_eq!(truncated.len(), MAX_AUDIT_BODY);
        assert!(truncated.ends_with("... (truncated)"));
    }
}
