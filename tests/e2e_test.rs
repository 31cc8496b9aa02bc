//! End-to-end tests of the assembled governance core.
//!
//! Runs without a database: credentials come from explicit variables, time
//! from a `TestClock`, and webhook receivers are wiremock servers.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use baatcheet::{App, Config};
use baatcheet_core::{OwnerId, Provider, TaskType, TestClock, WebhookEventKind};
use baatcheet_delivery::{client::SIGNATURE_HEADER, signing::verify_signature, AttemptOutcome};
use serde_json::json;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
}

async fn app_with(config: Config, pairs: &[(&str, &str)], clock: &TestClock) -> App {
    App::init_with(config, None, vars(pairs), Arc::new(clock.clone())).await.unwrap()
}

#[tokio::test]
async fn chat_falls_back_when_primary_provider_is_exhausted() {
    let clock = TestClock::new();
    let mut config = Config::default();
    config.daily_limits.insert("groq".to_string(), 2);

    let app = app_with(
        config,
        &[("GROQ_API_KEY", "gsk-primary-0001"), ("OPENROUTER_API_KEY", "sk-or-backup-0002")],
        &clock,
    )
    .await;

    assert_eq!(app.selector().select_provider(TaskType::Chat).await, Some(Provider::Groq));

    let first = app.pool().acquire(Provider::Groq).await.unwrap();
    let second = app.pool().acquire(Provider::Groq).await.unwrap();
    assert_eq!(first.secret, "gsk-primary-0001");
    assert_eq!(second.secret, "gsk-primary-0001");
    assert!(app.pool().acquire(Provider::Groq).await.is_none());

    assert_eq!(app.selector().select_provider(TaskType::Chat).await, Some(Provider::OpenRouter));

    let (provider, lease) = app.selector().acquire_for(TaskType::Chat).await.unwrap();
    assert_eq!(provider, Provider::OpenRouter);
    assert_eq!(lease.secret, "sk-or-backup-0002");

    app.shutdown().await;
}

#[tokio::test]
async fn keys_rotate_and_reset_at_midnight() {
    let clock = TestClock::at("2026-05-01T23:59:00Z".parse().unwrap());
    let mut config = Config::default();
    config.daily_limits.insert("gemini".to_string(), 1);

    let app = app_with(
        config,
        &[("GEMINI_API_KEY", "gem-a-1111"), ("GEMINI_API_KEY_2", "gem-b-2222"), ("GEMINI_API_KEY_3", "your_key_here")],
        &clock,
    )
    .await;

    assert_eq!(app.pool().key_count(Provider::Gemini).await, 2);
    assert_eq!(app.pool().acquire(Provider::Gemini).await.unwrap().index, 0);
    assert_eq!(app.pool().acquire(Provider::Gemini).await.unwrap().index, 1);
    assert!(!app.pool().has_capacity(Provider::Gemini).await);

    clock.advance(Duration::from_secs(120));
    assert!(app.pool().check_daily_reset().await);
    assert!(app.pool().has_capacity(Provider::Gemini).await);

    app.shutdown().await;
}

#[tokio::test]
async fn registered_webhook_receives_signed_event() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/baatcheet"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let clock = TestClock::new();
    let app = app_with(Config::default(), &[], &clock).await;
    let owner = OwnerId::new();

    let webhook = app
        .registry()
        .register(owner, &format!("{}/baatcheet", server.uri()), &["message.completed"])
        .await
        .unwrap();

    let report = app
        .dispatcher()
        .dispatch(owner, WebhookEventKind::MessageCompleted, json!({"conversation": "c-1"}))
        .await
        .unwrap();
    assert_eq!(report.delivered_first_attempt(), 1);

    let requests = server.received_requests().await.unwrap();
    let signature = requests[0].headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
    assert!(verify_signature(&requests[0].body, signature, &webhook.secret));

    let status = app.status().await;
    assert!(!status.persistent);
    assert_eq!(status.delivery.successful_deliveries, 1);

    app.shutdown().await;
}

#[tokio::test]
async fn configured_retry_policy_reaches_engine() {
    let clock = TestClock::new();
    let mut config = Config::default();
    config.delivery_max_attempts = 2;
    config.webhook_disable_threshold = 1;

    let app = app_with(config, &[], &clock).await;
    let owner = OwnerId::new();
    let webhook =
        app.registry().register(owner, "http://127.0.0.1:1/hook", &["usage.limit_reached"]).await.unwrap();

    let report =
        app.dispatcher().dispatch(owner, WebhookEventKind::UsageLimitReached, json!({})).await.unwrap();
    let outcomes = report.wait_all().await;
    assert!(matches!(outcomes[0].1, AttemptOutcome::Failed { .. }));

    let stats = app.status().await.delivery;
    assert_eq!(stats.attempts_made, 2);
    assert_eq!(stats.webhooks_disabled, 1);

    let view = app.registry().get(webhook.id, owner).await.unwrap().unwrap();
    assert!(!view.active);

    app.shutdown().await;
}

#[tokio::test]
async fn status_never_exposes_secrets() {
    let clock = TestClock::new();
    let app = app_with(Config::default(), &[("BRAVE_SEARCH_KEY", "brave-very-secret-9876")], &clock).await;

    let status = serde_json::to_string(&app.status().await).unwrap();
    assert!(!status.contains("brave-very-secret"));
    assert!(status.contains("9876"));

    app.shutdown().await;
}
